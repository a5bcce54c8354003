//! HTTP plumbing between a [`Session`](crate::session::Session) and the gateway.
//!
//! The session owns exactly one transport. It is opened by `create()`,
//! shared with the poll loop and every plugin handle, and closed by
//! `destroy()`. After `close()` every call fails with
//! [`GatewayError::TransportClosed`].

use std::{sync::RwLock, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::GatewayError;

#[async_trait]
pub trait GatewayTransport: Send + Sync + 'static {
    /// Make the transport usable. Opening an open transport is a no-op.
    async fn open(&self) -> Result<(), GatewayError>;

    /// POST a JSON body and decode the JSON reply.
    async fn post(&self, url: &str, body: Value) -> Result<Value, GatewayError>;

    /// GET with query parameters and decode the JSON reply. Used for the
    /// long-poll, so it may take as long as the gateway holds the request.
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, GatewayError>;

    /// Release the underlying connection pool.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// A [`reqwest`]-backed [`GatewayTransport`].
#[derive(Debug)]
pub struct ReqwestTransport {
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl ReqwestTransport {
    /// `timeout` bounds every request, including the long-poll GET, so it
    /// must be longer than the gateway's hold time (30 s for Janus).
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<reqwest::Client, GatewayError> {
        self.client
            .read()
            .map_err(|_| GatewayError::TransportClosed)?
            .clone()
            .ok_or(GatewayError::TransportClosed)
    }
}

#[async_trait]
impl GatewayTransport for ReqwestTransport {
    async fn open(&self) -> Result<(), GatewayError> {
        let mut guard = self
            .client
            .write()
            .map_err(|_| GatewayError::TransportClosed)?;
        if guard.is_none() {
            let client = reqwest::Client::builder().timeout(self.timeout).build()?;
            *guard = Some(client);
            debug!(timeout_ms = self.timeout.as_millis() as u64, "http transport opened");
        }
        Ok(())
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value, GatewayError> {
        let client = self.client()?;
        trace!(%url, %body, "POST");
        let reply = client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        trace!(%url, %reply, "POST reply");
        Ok(reply)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value, GatewayError> {
        let client = self.client()?;
        let reply = client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        trace!(%url, %reply, "GET reply");
        Ok(reply)
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.client.write() {
            if guard.take().is_some() {
                debug!("http transport closed");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.client.read().map(|c| c.is_some()).unwrap_or(false)
    }
}
