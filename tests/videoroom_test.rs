// tests/videoroom_test.rs
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use janus_client::{Jsep, Session, SessionConfig, test_util::ScriptedTransport};
use janus_signal::{
    app,
    config::ClientConfig,
    logger::LogConfig,
    videoroom::{MediaRequest, Negotiator, Publisher, VideoRoom, subscribe},
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use url::Url;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct FakeNegotiator {
    calls: Mutex<Vec<String>>,
}

impl FakeNegotiator {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn create_offer(&self, media: &MediaRequest) -> Result<Jsep> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("offer video={}", media.video));
        Ok(Jsep::new("offer", "v=0 local-offer"))
    }

    async fn apply_answer(&self, answer: Jsep) -> Result<()> {
        self.calls.lock().unwrap().push(format!("answer {}", answer.sdp));
        Ok(())
    }

    async fn create_answer(&self, offer: Jsep) -> Result<Jsep> {
        self.calls.lock().unwrap().push(format!("remote {}", offer.sdp));
        Ok(Jsep::new("answer", "v=0 local-answer"))
    }
}

fn session(transport: Arc<ScriptedTransport>) -> Session {
    Session::with_transport(
        "http://gateway.test/janus",
        transport,
        SessionConfig {
            request_timeout: Duration::from_secs(5),
            poll_retry_delay: Duration::from_millis(10),
        },
    )
}

/// Answer every plugin message with the event `reply(body)` builds, the way
/// the video-room plugin does after its `ack`. Bodies are recorded.
fn plugin_responder(
    transport: Arc<ScriptedTransport>,
    reply: impl Fn(&Value) -> Value + Send + 'static,
) -> (JoinHandle<()>, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let record = seen.clone();
    let task = tokio::spawn(async move {
        loop {
            let (url, body) = transport.next_post().await;
            if body["janus"] != "message" {
                continue;
            }
            let sender: u64 = url.rsplit('/').next().unwrap().parse().unwrap();
            let mut event = reply(&body);
            event["janus"] = json!("event");
            event["sender"] = json!(sender);
            event["transaction"] = body["transaction"].clone();
            record.lock().unwrap().push(body);
            transport.inject(event);
        }
    });
    (task, seen)
}

fn room_event(data: Value) -> Value {
    json!({"plugindata": {"plugin": "janus.plugin.videoroom", "data": data}})
}

#[tokio::test]
async fn join_lists_existing_publishers() {
    let transport = ScriptedTransport::new().with_session_id(1);
    transport.push_plugin_id(10);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let (responder, seen) = plugin_responder(transport.clone(), |_| {
        room_event(json!({
            "videoroom": "joined",
            "room": 1234,
            "id": 555,
            "publishers": [{"id": 1, "display": "alice"}, {"id": 2}],
        }))
    });

    let room = VideoRoom::attach(&session, 1234, REPLY_TIMEOUT).await.unwrap();
    let publishers = room.join_as_publisher("bot").await.unwrap();

    assert_eq!(
        publishers,
        vec![
            Publisher { id: 1, display: Some("alice".into()) },
            Publisher { id: 2, display: None },
        ]
    );
    let body = seen.lock().unwrap()[0]["body"].clone();
    assert_eq!(
        body,
        json!({"request": "join", "ptype": "publisher", "room": 1234, "display": "bot"})
    );

    responder.abort();
    session.destroy().await.unwrap();
}

#[tokio::test]
async fn publish_sends_offer_and_applies_answer() {
    let transport = ScriptedTransport::new().with_session_id(1);
    transport.push_plugin_id(10);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let (responder, seen) = plugin_responder(transport.clone(), |_| {
        let mut event = room_event(json!({"videoroom": "event", "configured": "ok"}));
        event["jsep"] = json!({"type": "answer", "sdp": "v=0 remote-answer"});
        event
    });

    let negotiator = FakeNegotiator::default();
    let room = VideoRoom::attach(&session, 1234, REPLY_TIMEOUT).await.unwrap();
    room.publish(&negotiator, MediaRequest::default()).await.unwrap();

    let sent = seen.lock().unwrap()[0].clone();
    assert_eq!(
        sent["body"],
        json!({"request": "configure", "audio": false, "video": true, "data": true})
    );
    assert_eq!(sent["jsep"]["type"], "offer");
    assert_eq!(sent["jsep"]["trickle"], false);
    assert_eq!(
        negotiator.calls(),
        vec!["offer video=true".to_string(), "answer v=0 remote-answer".to_string()]
    );

    responder.abort();
    session.destroy().await.unwrap();
}

#[tokio::test]
async fn subscribe_answers_the_gateway_offer() {
    let transport = ScriptedTransport::new().with_session_id(1);
    transport.push_plugin_id(20);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let (responder, seen) = plugin_responder(transport.clone(), |body| {
        match body["body"]["request"].as_str() {
            Some("join") => {
                let mut event = room_event(json!({"videoroom": "attached", "id": 1}));
                event["jsep"] = json!({"type": "offer", "sdp": "v=0 remote-offer"});
                event
            }
            _ => room_event(json!({"videoroom": "event", "started": "ok"})),
        }
    });

    let negotiator = FakeNegotiator::default();
    let handle = subscribe(&session, 1234, 1, &negotiator, REPLY_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(handle.id(), 20);

    let bodies = seen.lock().unwrap().clone();
    assert_eq!(
        bodies[0]["body"],
        json!({"request": "join", "ptype": "subscriber", "room": 1234, "feed": 1})
    );
    assert_eq!(bodies[1]["body"], json!({"request": "start"}));
    assert_eq!(bodies[1]["jsep"]["sdp"], "v=0 local-answer");
    assert_eq!(negotiator.calls(), vec!["remote v=0 remote-offer".to_string()]);

    responder.abort();
    session.destroy().await.unwrap();
}

#[tokio::test]
async fn room_errors_fail_the_join() {
    let transport = ScriptedTransport::new().with_session_id(1);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let (responder, _) = plugin_responder(transport.clone(), |_| {
        room_event(json!({"videoroom": "event", "error_code": 426, "error": "No such room (9)"}))
    });

    let room = VideoRoom::attach(&session, 9, REPLY_TIMEOUT).await.unwrap();
    let err = room.join_as_publisher("bot").await.unwrap_err();
    assert!(err.to_string().contains("426"), "{err}");

    responder.abort();
    session.destroy().await.unwrap();
}

#[tokio::test]
async fn silent_plugin_hits_the_reply_timeout() {
    let transport = ScriptedTransport::new().with_session_id(1);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let room = VideoRoom::attach(&session, 1234, Duration::from_millis(50))
        .await
        .unwrap();
    let err = room.join_as_publisher("bot").await.unwrap_err();
    assert!(err.to_string().contains("no reply"), "{err}");

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn late_reply_does_not_poison_the_next_call() {
    let transport = ScriptedTransport::new().with_session_id(1);
    transport.push_plugin_id(10);
    let mut session = session(transport.clone());
    session.create().await.unwrap();

    let room = VideoRoom::attach(&session, 1234, Duration::from_millis(50))
        .await
        .unwrap();
    let first = {
        let room = room.clone();
        tokio::spawn(async move { room.join_as_publisher("bot").await })
    };
    let (_, late_tx) = transport.next_message_transaction().await;
    assert!(first.await.unwrap().is_err());

    // the gateway finally answers the abandoned join
    transport.inject(json!({
        "janus": "event",
        "sender": 10,
        "transaction": late_tx,
        "plugindata": {"data": {"videoroom": "joined", "publishers": []}},
    }));
    while transport.poll_count() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (responder, _) = plugin_responder(transport.clone(), |_| {
        room_event(json!({"videoroom": "joined", "publishers": [{"id": 4}]}))
    });
    let publishers = room.join_as_publisher("bot").await.unwrap();
    assert_eq!(publishers, vec![Publisher { id: 4, display: None }]);

    responder.abort();
    session.destroy().await.unwrap();
}

#[tokio::test]
async fn participants_come_back_synchronously() {
    let transport = ScriptedTransport::new().with_session_id(1);
    transport.push_plugin_id(10);
    let mut session = session(transport.clone());
    session.create().await.unwrap();
    let room = VideoRoom::attach(&session, 1234, REPLY_TIMEOUT).await.unwrap();

    transport.push_reply(Ok(json!({
        "janus": "success",
        "sender": 10,
        "plugindata": {"plugin": "janus.plugin.videoroom", "data": {
            "videoroom": "participants",
            "room": 1234,
            "participants": [{"id": 3, "display": "carol", "publisher": true}],
        }},
    })));

    let participants = room.list_participants().await.unwrap();
    assert_eq!(participants, vec![Publisher { id: 3, display: Some("carol".into()) }]);

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn app_run_joins_and_returns_publishers() {
    let transport = ScriptedTransport::new().with_session_id(1);
    let mut session = session(transport.clone());

    let (responder, _) = plugin_responder(transport.clone(), |_| {
        room_event(json!({"videoroom": "joined", "publishers": [{"id": 8, "display": "dave"}]}))
    });

    let config = ClientConfig {
        root_url: Url::parse("http://gateway.test/janus").unwrap(),
        room: 1234,
        display: "bot".into(),
        hold: Duration::ZERO,
        reply_timeout: REPLY_TIMEOUT,
        log: LogConfig::default(),
        session: SessionConfig::default(),
    };

    let publishers = app::run(&config, &mut session).await.unwrap();
    assert_eq!(publishers[0].id, 8);
    assert!(session.is_polling());

    responder.abort();
    session.destroy().await.unwrap();
    assert!(!session.is_polling());
}
