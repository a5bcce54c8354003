//! An in-memory stand-in for the gateway, for tests.
//!
//! POSTs are recorded and answered like Janus would (`create`/`attach`/
//! `detach`/`destroy` -> `success`, `message` -> `ack`) unless a reply was
//! queued with [`ScriptedTransport::push_reply`]. The long-poll GET hands
//! out whatever was [`inject`](ScriptedTransport::inject)ed, one item per
//! poll, and otherwise hangs like a real long-poll.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{
    Mutex,
    mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use crate::{error::GatewayError, transport::GatewayTransport};

type Poll = (String, Vec<(String, String)>);

pub struct ScriptedTransport {
    open: AtomicBool,
    session_id: AtomicU64,
    next_plugin_id: AtomicU64,
    plugin_ids: StdMutex<VecDeque<u64>>,
    replies: StdMutex<VecDeque<Result<Value, GatewayError>>>,
    fail_destroy: AtomicBool,
    posts: StdMutex<Vec<(String, Value)>>,
    polls: AtomicUsize,
    post_tx: UnboundedSender<(String, Value)>,
    post_rx: Mutex<UnboundedReceiver<(String, Value)>>,
    poll_tx: UnboundedSender<Poll>,
    poll_rx: Mutex<UnboundedReceiver<Poll>>,
    event_tx: UnboundedSender<Result<Value, GatewayError>>,
    event_rx: Mutex<UnboundedReceiver<Result<Value, GatewayError>>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (post_tx, post_rx) = unbounded_channel();
        let (poll_tx, poll_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        Arc::new(Self {
            open: AtomicBool::new(false),
            session_id: AtomicU64::new(1),
            next_plugin_id: AtomicU64::new(100),
            plugin_ids: StdMutex::new(VecDeque::new()),
            replies: StdMutex::new(VecDeque::new()),
            fail_destroy: AtomicBool::new(false),
            posts: StdMutex::new(vec![]),
            polls: AtomicUsize::new(0),
            post_tx,
            post_rx: Mutex::new(post_rx),
            poll_tx,
            poll_rx: Mutex::new(poll_rx),
            event_tx,
            event_rx: Mutex::new(event_rx),
        })
    }

    /// Id handed out by the next `create`.
    pub fn with_session_id(self: Arc<Self>, id: u64) -> Arc<Self> {
        self.session_id.store(id, Ordering::SeqCst);
        self
    }

    /// Queue the id handed out by the next `attach`.
    pub fn push_plugin_id(&self, id: u64) {
        self.plugin_ids.lock().unwrap().push_back(id);
    }

    /// Queue a verbatim answer for the next POST, whatever it is.
    pub fn push_reply(&self, reply: Result<Value, GatewayError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Make every `destroy` fail at the transport level.
    pub fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    /// Hand a message to the next long-poll.
    pub fn inject(&self, event: Value) {
        let _ = self.event_tx.send(Ok(event));
    }

    /// Make the next long-poll fail.
    pub fn inject_error(&self, err: GatewayError) {
        let _ = self.event_tx.send(Err(err));
    }

    /// Wait for the next POST (url, body).
    pub async fn next_post(&self) -> (String, Value) {
        self.post_rx
            .lock()
            .await
            .recv()
            .await
            .expect("post channel closed")
    }

    /// Wait for the next long-poll GET (url, query).
    pub async fn next_poll(&self) -> Poll {
        self.poll_rx
            .lock()
            .await
            .recv()
            .await
            .expect("poll channel closed")
    }

    /// Wait for the next POST of a `message` and return its transaction.
    pub async fn next_message_transaction(&self) -> (String, String) {
        loop {
            let (url, body) = self.next_post().await;
            if body["janus"] == "message" {
                let tx = body["transaction"].as_str().unwrap_or_default().to_owned();
                return (url, tx);
            }
        }
    }

    /// Long-poll GETs issued so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    fn auto_reply(&self, body: &Value) -> Result<Value, GatewayError> {
        let tx = body["transaction"].clone();
        let reply = match body["janus"].as_str().unwrap_or_default() {
            "create" => {
                let id = self.session_id.load(Ordering::SeqCst);
                json!({"janus": "success", "transaction": tx, "data": {"id": id}})
            }
            "attach" => {
                let id = self
                    .plugin_ids
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| self.next_plugin_id.fetch_add(1, Ordering::SeqCst));
                json!({"janus": "success", "transaction": tx, "data": {"id": id}})
            }
            "message" => json!({"janus": "ack", "transaction": tx}),
            "destroy" if self.fail_destroy.load(Ordering::SeqCst) => {
                return Err(GatewayError::Transport("destroy refused".into()));
            }
            "detach" | "destroy" => json!({"janus": "success", "transaction": tx}),
            other => json!({"janus": "error", "transaction": tx,
                "error": {"code": 456, "reason": format!("Unhandled request '{other}'")}}),
        };
        Ok(reply)
    }
}

#[async_trait]
impl GatewayTransport for ScriptedTransport {
    async fn open(&self) -> Result<(), GatewayError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value, GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        self.posts
            .lock()
            .unwrap()
            .push((url.to_owned(), body.clone()));
        let _ = self.post_tx.send((url.to_owned(), body.clone()));

        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(reply) => reply,
            None => self.auto_reply(&body),
        }
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::TransportClosed);
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let query = query
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        let _ = self.poll_tx.send((url.to_owned(), query));

        match self.event_rx.lock().await.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
