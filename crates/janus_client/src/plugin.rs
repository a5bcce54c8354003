use std::{
    fmt,
    sync::{Arc, Weak},
};

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error};

use crate::{
    envelope::{Envelope, GatewayEvent, expect_reply},
    error::GatewayError,
    event_queue::EventQueue,
    session::SessionShared,
    transport::GatewayTransport,
};

const NOTIFICATION_CAPACITY: usize = 64;

/// One plugin attached to a gateway session.
///
/// Cloning is cheap; every clone talks to the same inbox. Requests on one
/// handle must be issued one at a time: the reply to a `send` is simply the
/// next transactional event the gateway routes to this plugin.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<PluginInner>,
}

struct PluginInner {
    id: u64,
    plugin: String,
    url: String,
    session: Weak<SessionShared>,
    inbox: EventQueue,
    notifications: broadcast::Sender<Value>,
    in_flight: Mutex<()>,
}

impl PluginHandle {
    pub(crate) fn new(
        id: u64,
        plugin: impl Into<String>,
        url: String,
        session: Weak<SessionShared>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            inner: Arc::new(PluginInner {
                id,
                plugin: plugin.into(),
                url,
                session,
                inbox: EventQueue::new(),
                notifications,
                in_flight: Mutex::new(()),
            }),
        }
    }

    /// Gateway-assigned handle id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Plugin package name, e.g. `janus.plugin.videoroom`.
    pub fn plugin(&self) -> &str {
        &self.inner.plugin
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Send a plugin message and wait for its asynchronous result.
    ///
    /// The gateway must acknowledge the POST with `ack`; the result is the
    /// next event delivered to this handle and must carry our transaction.
    /// No timeout is applied here; wrap the call if you need a deadline.
    pub async fn send(&self, payload: Value) -> Result<GatewayEvent, GatewayError> {
        let _in_flight = self
            .inner
            .in_flight
            .try_lock()
            .map_err(|_| GatewayError::SendInProgress(self.inner.id))?;

        let envelope = Envelope::message(payload)?;
        let transport = self.transport()?;

        debug!(
            plugin_id = self.inner.id,
            transaction = %envelope.transaction,
            "sending plugin message"
        );
        let reply = transport.post(&self.inner.url, envelope.to_value()?).await?;
        expect_reply(&reply, "ack")?;
        drop(transport);

        let event = self
            .inner
            .inbox
            .take_next()
            .await
            .ok_or(GatewayError::InboxClosed)?;

        let got = event
            .get("transaction")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if got != envelope.transaction {
            error!(
                plugin_id = self.inner.id,
                expected = %envelope.transaction,
                got,
                "event does not answer the outstanding request"
            );
            return Err(GatewayError::TransactionMismatch {
                expected: envelope.transaction,
                got: got.to_owned(),
            });
        }

        Ok(GatewayEvent::new(event))
    }

    /// Send a plugin request the gateway answers synchronously with
    /// `success` (e.g. video-room `list` or `exists`). Nothing is read from
    /// the inbox.
    pub async fn request(&self, payload: Value) -> Result<GatewayEvent, GatewayError> {
        let envelope = Envelope::message(payload)?;
        let reply = self
            .transport()?
            .post(&self.inner.url, envelope.to_value()?)
            .await?;
        expect_reply(&reply, "success")?;
        Ok(GatewayEvent::new(reply))
    }

    /// Events for this plugin that answer no request (no `transaction`).
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.inner.notifications.subscribe()
    }

    /// Route an event from the poll loop.
    pub(crate) fn deliver(&self, event: Value) {
        if event.get("transaction").is_some() {
            if !self.inner.inbox.put(event) {
                debug!(plugin_id = self.inner.id, "event for a closed handle dropped");
            }
            return;
        }
        if self.inner.notifications.send(event).is_err() {
            debug!(
                plugin_id = self.inner.id,
                "notification dropped, nobody subscribed"
            );
        }
    }

    /// Drop events left in the inbox by requests whose caller stopped
    /// waiting, e.g. a `send` abandoned by a timeout. Does nothing while a
    /// `send` is in flight. Returns how many events were dropped.
    pub fn discard_stale(&self) -> usize {
        let Ok(_idle) = self.inner.in_flight.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while self.inner.inbox.try_take_next().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Called on detach and destroy: a pending or later `send` ends with
    /// [`GatewayError::InboxClosed`] instead of waiting forever.
    pub(crate) fn close(&self) {
        self.inner.inbox.close();
    }

    #[cfg(test)]
    pub(crate) fn inbox(&self) -> &EventQueue {
        &self.inner.inbox
    }

    fn transport(&self) -> Result<Arc<dyn GatewayTransport>, GatewayError> {
        let session = self
            .inner
            .session
            .upgrade()
            .ok_or(GatewayError::SessionGone)?;
        Ok(session.transport.clone())
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("plugin", &self.inner.plugin)
            .field("url", &self.inner.url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedTransport;
    use serde_json::json;
    use tokio::time::{Duration, timeout};

    fn make_handle(transport: Arc<ScriptedTransport>) -> (Arc<SessionShared>, PluginHandle) {
        let shared = Arc::new(SessionShared::new(transport));
        let handle = PluginHandle::new(
            10,
            "janus.plugin.echotest",
            "http://gw/janus/1/10".into(),
            Arc::downgrade(&shared),
        );
        (shared, handle)
    }

    #[tokio::test]
    async fn send_returns_matching_event() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        let (_shared, handle) = make_handle(transport.clone());

        let task = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(json!({"ping": 1})).await })
        };

        let (url, body) = transport.next_post().await;
        assert_eq!(url, "http://gw/janus/1/10");
        assert_eq!(body["janus"], "message");
        assert_eq!(body["ping"], 1);

        let tx = body["transaction"].as_str().unwrap().to_owned();
        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": tx, "result": "pong"}));

        let ev = timeout(Duration::from_secs(1), task)
            .await
            .expect("timed-out")
            .unwrap()
            .unwrap();
        assert_eq!(ev["result"], "pong");
        assert_eq!(ev.transaction(), Some(tx.as_str()));
    }

    #[tokio::test]
    async fn mismatched_transaction_is_an_error() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        let (_shared, handle) = make_handle(transport.clone());
        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": "stale"}));

        let err = handle.send(json!({"ping": 1})).await.unwrap_err();
        match err {
            GatewayError::TransactionMismatch { got, .. } => assert_eq!(got, "stale"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_ack_reply_fails_fast() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        transport.push_reply(Ok(json!({"janus": "success"})));
        let (_shared, handle) = make_handle(transport.clone());

        let err = handle.send(json!({"ping": 1})).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedReply { expected: "ack", .. }));
        assert!(handle.inbox().is_empty());
    }

    #[tokio::test]
    async fn second_concurrent_send_is_refused() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        let (_shared, handle) = make_handle(transport.clone());

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(json!({"n": 1})).await })
        };
        let _ = transport.next_post().await;

        let err = handle.send(json!({"n": 2})).await.unwrap_err();
        assert!(matches!(err, GatewayError::SendInProgress(10)));
        first.abort();
    }

    #[tokio::test]
    async fn notifications_bypass_the_inbox() {
        let transport = ScriptedTransport::new();
        let (_shared, handle) = make_handle(transport);
        let mut rx = handle.subscribe();

        handle.deliver(json!({"janus": "event", "sender": 10, "plugindata": {"data": {"publishers": []}}}));

        assert!(handle.inbox().is_empty());
        let note = rx.recv().await.unwrap();
        assert!(note["plugindata"]["data"]["publishers"].is_array());
    }

    #[tokio::test]
    async fn send_after_session_drop_fails() {
        let transport = ScriptedTransport::new();
        let (shared, handle) = make_handle(transport);
        drop(shared);
        let err = handle.send(json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionGone));
    }

    #[tokio::test]
    async fn closing_wakes_a_waiting_send() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        let (_shared, handle) = make_handle(transport.clone());

        let task = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(json!({"ping": 1})).await })
        };
        let _ = transport.next_post().await;

        handle.close();
        let err = timeout(Duration::from_secs(1), task)
            .await
            .expect("timed-out")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, GatewayError::InboxClosed));

        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": "late"}));
        assert!(handle.inbox().is_empty());
    }

    #[tokio::test]
    async fn stale_events_are_discarded_before_the_next_send() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        let (_shared, handle) = make_handle(transport.clone());
        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": "old-1"}));
        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": "old-2"}));

        assert_eq!(handle.discard_stale(), 2);
        assert!(handle.inbox().is_empty());

        let task = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send(json!({"ping": 1})).await })
        };
        let (_, body) = transport.next_post().await;
        // a send is in flight, so nothing may be discarded now
        assert_eq!(handle.discard_stale(), 0);
        handle.deliver(json!({"janus": "event", "sender": 10, "transaction": body["transaction"]}));

        let ev = timeout(Duration::from_secs(1), task)
            .await
            .expect("timed-out")
            .unwrap()
            .unwrap();
        assert_eq!(ev.transaction(), body["transaction"].as_str());
    }

    #[tokio::test]
    async fn request_expects_synchronous_success() {
        let transport = ScriptedTransport::new();
        transport.open().await.unwrap();
        transport.push_reply(Ok(json!({
            "janus": "success",
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {"exists": true}}
        })));
        let (_shared, handle) = make_handle(transport);

        let reply = handle
            .request(json!({"body": {"request": "exists", "room": 1234}}))
            .await
            .unwrap();
        assert_eq!(reply.plugin_data().unwrap()["exists"], true);
    }
}
