//! Gateway session lifecycle, plugin registry and the long-poll loop.
//!
//! ```text
//!   Idle ──create()──► Creating ──ok──► Active ──destroy()──► Destroying ──► Idle
//!                         │                                        ▲
//!                         └──────────────── error ─────────────────┘ (back to Idle)
//! ```
//!
//! While a session is active exactly one poll task runs. It GETs
//! `{session_url}?maxev=1&rid=<ms>` in a loop and routes every `event` to
//! the registered [`PluginHandle`] named by its `sender`.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    envelope::{Envelope, ReplyKind, data_id, expect_reply, rejection},
    error::GatewayError,
    plugin::PluginHandle,
    transport::{GatewayTransport, ReqwestTransport},
};

/// Janus error code for a session it no longer knows (expired or destroyed).
pub const NO_SUCH_SESSION: i64 = 458;

/// Tunables for a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound for every HTTP request, long-poll included.
    pub request_timeout: Duration,
    /// Pause after a failed or refused poll before polling again.
    pub poll_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            poll_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Creating,
    Active,
    Destroying,
}

impl SessionState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Creating => "creating",
            SessionState::Active => "active",
            SessionState::Destroying => "destroying",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between the session, its poll task and its plugin handles.
pub(crate) struct SessionShared {
    pub(crate) transport: Arc<dyn GatewayTransport>,
    pub(crate) plugins: DashMap<u64, PluginHandle>,
}

impl SessionShared {
    pub(crate) fn new(transport: Arc<dyn GatewayTransport>) -> Self {
        Self {
            transport,
            plugins: DashMap::new(),
        }
    }

    /// Route one message received from the long-poll.
    fn dispatch(&self, msg: Value) {
        let kind = ReplyKind::of(&msg);
        if kind != ReplyKind::Event {
            trace!(kind = kind.as_str(), "ignoring non-event message");
            return;
        }

        let Some(sender) = msg.get("sender").and_then(Value::as_u64) else {
            warn!(%msg, "event without sender, dropping");
            return;
        };

        let handle = self.plugins.get(&sender).map(|h| h.value().clone());
        match handle {
            Some(handle) => {
                debug!(plugin_id = sender, "dispatching event");
                handle.deliver(msg);
            }
            None => warn!(plugin_id = sender, %msg, "orphan event for unknown plugin, dropping"),
        }
    }
}

struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A client-side gateway session.
pub struct Session {
    root_url: String,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    state: SessionState,
    session_id: Option<u64>,
    session_url: Option<String>,
    poll: Option<PollTask>,
}

impl Session {
    /// A session talking HTTP to `root_url` (e.g. `http://localhost:8088/janus`).
    pub fn new(root_url: impl Into<String>) -> Self {
        Self::with_config(root_url, SessionConfig::default())
    }

    pub fn with_config(root_url: impl Into<String>, config: SessionConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout));
        Self::with_transport(root_url, transport, config)
    }

    pub fn with_transport(
        root_url: impl Into<String>,
        transport: Arc<dyn GatewayTransport>,
        config: SessionConfig,
    ) -> Self {
        Self {
            root_url: root_url.into().trim_end_matches('/').to_owned(),
            config,
            shared: Arc::new(SessionShared::new(transport)),
            state: SessionState::Idle,
            session_id: None,
            session_url: None,
            poll: None,
        }
    }

    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub fn session_url(&self) -> Option<&str> {
        self.session_url.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while the poll task is alive.
    pub fn is_polling(&self) -> bool {
        self.poll.as_ref().is_some_and(|p| !p.handle.is_finished())
    }

    pub fn plugin(&self, id: u64) -> Option<PluginHandle> {
        self.shared.plugins.get(&id).map(|h| h.value().clone())
    }

    pub fn plugin_ids(&self) -> Vec<u64> {
        self.shared.plugins.iter().map(|kv| *kv.key()).collect()
    }

    /// Create the gateway session and start polling for its events.
    pub async fn create(&mut self) -> Result<(), GatewayError> {
        if self.state != SessionState::Idle {
            return Err(self.invalid("create"));
        }
        self.state = SessionState::Creating;

        match self.open_session().await {
            Ok(id) => {
                let url = format!("{}/{}", self.root_url, id);
                self.poll = Some(self.spawn_poll(url.clone()));
                self.session_id = Some(id);
                self.session_url = Some(url);
                self.state = SessionState::Active;
                info!(session_id = id, "🟢 gateway session created");
                Ok(())
            }
            Err(err) => {
                self.shared.transport.close().await;
                self.state = SessionState::Idle;
                error!(error = %err, root = %self.root_url, "could not create gateway session");
                Err(err)
            }
        }
    }

    async fn open_session(&self) -> Result<u64, GatewayError> {
        self.shared.transport.open().await?;
        let envelope = Envelope::create();
        let reply = self
            .shared
            .transport
            .post(&self.root_url, envelope.to_value()?)
            .await?;
        expect_reply(&reply, "success")?;
        data_id(&reply)
    }

    /// Attach `plugin` (e.g. `janus.plugin.videoroom`) to this session.
    pub async fn attach(&self, plugin: &str) -> Result<PluginHandle, GatewayError> {
        let session_url = self.active_url("attach")?;

        let envelope = Envelope::attach(plugin);
        let reply = self
            .shared
            .transport
            .post(session_url, envelope.to_value()?)
            .await?;
        expect_reply(&reply, "success")?;
        let id = data_id(&reply)?;

        let handle = PluginHandle::new(
            id,
            plugin,
            format!("{session_url}/{id}"),
            Arc::downgrade(&self.shared),
        );
        self.shared.plugins.insert(id, handle.clone());
        info!(session_id = ?self.session_id, plugin_id = id, plugin, "🔌 plugin attached");
        Ok(handle)
    }

    /// Detach a plugin handle. The handle leaves the registry and its inbox
    /// is closed even when the gateway refuses the detach; later events for
    /// it are orphans.
    pub async fn detach(&self, handle: &PluginHandle) -> Result<(), GatewayError> {
        self.active_url("detach")?;
        self.shared.plugins.remove(&handle.id());
        handle.close();

        let envelope = Envelope::detach();
        let reply = self
            .shared
            .transport
            .post(handle.url(), envelope.to_value()?)
            .await?;
        expect_reply(&reply, "success")?;
        info!(plugin_id = handle.id(), "plugin detached");
        Ok(())
    }

    /// Tear the session down: stop polling, destroy it on the gateway and
    /// close the transport.
    ///
    /// Every step runs even if an earlier one failed. The first failure is
    /// returned once local cleanup is complete. Destroying an idle session
    /// does nothing.
    pub async fn destroy(&mut self) -> Result<(), GatewayError> {
        if self.state == SessionState::Idle
            && self.poll.is_none()
            && self.session_url.is_none()
            && !self.shared.transport.is_open()
        {
            return Ok(());
        }
        self.state = SessionState::Destroying;
        let mut outcome = Ok(());

        if let Some(poll) = self.poll.take() {
            poll.cancel.cancel();
            if let Err(err) = poll.handle.await {
                if !err.is_cancelled() {
                    error!(error = %err, "poll task ended abnormally");
                }
            }
        }

        if let Some(url) = self.session_url.take() {
            match self.remote_destroy(&url).await {
                Ok(()) => info!(session_id = ?self.session_id, "🛑 gateway session destroyed"),
                Err(err) => {
                    error!(error = %err, session_id = ?self.session_id, "gateway refused to destroy session");
                    outcome = Err(err);
                }
            }
        }

        self.session_id = None;
        self.shared.plugins.iter().for_each(|h| h.value().close());
        self.shared.plugins.clear();
        self.shared.transport.close().await;
        self.state = SessionState::Idle;
        outcome
    }

    async fn remote_destroy(&self, url: &str) -> Result<(), GatewayError> {
        let envelope = Envelope::destroy();
        let reply = self.shared.transport.post(url, envelope.to_value()?).await?;
        expect_reply(&reply, "success")
    }

    fn active_url(&self, operation: &'static str) -> Result<&str, GatewayError> {
        match (&self.state, &self.session_url) {
            (SessionState::Active, Some(url)) => Ok(url),
            _ => Err(self.invalid(operation)),
        }
    }

    fn invalid(&self, operation: &'static str) -> GatewayError {
        GatewayError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn spawn_poll(&self, session_url: String) -> PollTask {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&self.shared),
            self.shared.transport.clone(),
            session_url,
            self.config.poll_retry_delay,
            cancel.clone(),
        ));
        PollTask { cancel, handle }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(poll) = &self.poll {
            poll.cancel.cancel();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("root_url", &self.root_url)
            .field("state", &self.state)
            .field("session_id", &self.session_id)
            .field("plugins", &self.plugin_ids())
            .finish()
    }
}

async fn poll_loop(
    shared: Weak<SessionShared>,
    transport: Arc<dyn GatewayTransport>,
    session_url: String,
    retry_delay: Duration,
    cancel: CancellationToken,
) {
    debug!(%session_url, "poll loop started");
    loop {
        let query = [
            ("maxev", "1".to_owned()),
            ("rid", Utc::now().timestamp_millis().to_string()),
        ];
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = transport.get(&session_url, &query) => reply,
        };

        match reply {
            Ok(reply) if ReplyKind::of(&reply) == ReplyKind::Error => match rejection(&reply) {
                GatewayError::Rejected {
                    code: NO_SUCH_SESSION,
                    reason,
                } => {
                    error!(%session_url, %reason, "gateway no longer knows this session, polling stopped");
                    break;
                }
                err => {
                    warn!(error = %err, %session_url, "gateway refused long-poll, retrying");
                    if backoff(&cancel, retry_delay).await {
                        break;
                    }
                }
            },
            Ok(reply) => {
                let Some(shared) = shared.upgrade() else { break };
                match reply {
                    Value::Array(batch) => batch.into_iter().for_each(|msg| shared.dispatch(msg)),
                    msg => shared.dispatch(msg),
                }
            }
            Err(GatewayError::TransportClosed) => break,
            Err(err) => {
                warn!(error = %err, %session_url, "long-poll failed, retrying");
                if backoff(&cancel, retry_delay).await {
                    break;
                }
            }
        }
    }
    debug!(%session_url, "poll loop stopped");
}

/// Sleep before the next poll. True if cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
