//! Wire envelopes for the Janus HTTP API.
//!
//! Every request posted to the gateway is a JSON object carrying the
//! request kind in `janus` and a client generated `transaction`:
//!
//! ```text
//! POST {root}            {"janus":"create","transaction":T}            -> success {data.id = S}
//! POST {root}/{S}        {"janus":"attach","plugin":P,"transaction":T} -> success {data.id = H}
//! POST {root}/{S}/{H}    {"janus":"message","transaction":T, ...body}  -> ack
//! GET  {root}/{S}?maxev=1&rid=<ms>                                     -> event {sender = H, transaction = T}
//! POST {root}/{S}/{H}    {"janus":"detach","transaction":T}            -> success
//! POST {root}/{S}        {"janus":"destroy","transaction":T}           -> success
//! ```
//!
//! Replies to POSTs are only acknowledgements. Plugin results come back
//! later as `event`s through the long-poll.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::GatewayError, transaction::transaction_id};

/// Request kinds the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Create,
    Attach,
    Message,
    Detach,
    Destroy,
}

impl RequestKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Create => "create",
            RequestKind::Attach => "attach",
            RequestKind::Message => "message",
            RequestKind::Detach => "detach",
            RequestKind::Destroy => "destroy",
        }
    }
}

/// Reply and event kinds the gateway sends back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Ack,
    Success,
    Error,
    Event,
    /// keepalive, webrtcup, media, hangup, ...
    Other(String),
}

impl ReplyKind {
    pub fn of(message: &Value) -> Self {
        match message.get("janus").and_then(Value::as_str) {
            Some("ack") => ReplyKind::Ack,
            Some("success") => ReplyKind::Success,
            Some("error") => ReplyKind::Error,
            Some("event") => ReplyKind::Event,
            Some(other) => ReplyKind::Other(other.to_owned()),
            None => ReplyKind::Other(String::new()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReplyKind::Ack => "ack",
            ReplyKind::Success => "success",
            ReplyKind::Error => "error",
            ReplyKind::Event => "event",
            ReplyKind::Other(s) => s,
        }
    }
}

/// An outbound request: `janus` + `transaction` + request specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub janus: String,
    pub transaction: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    fn new(kind: RequestKind) -> Self {
        Self {
            janus: kind.as_str().to_owned(),
            transaction: transaction_id(),
            fields: Map::new(),
        }
    }

    pub fn create() -> Self {
        Self::new(RequestKind::Create)
    }

    pub fn attach(plugin: impl Into<String>) -> Self {
        let mut env = Self::new(RequestKind::Attach);
        env.fields
            .insert("plugin".to_owned(), Value::String(plugin.into()));
        env
    }

    /// Wrap a plugin payload (`{"body": ..., "jsep": ...}`).
    ///
    /// The payload must be a JSON object. Its own `janus` / `transaction`
    /// keys are dropped so they can never override correlation.
    pub fn message(payload: Value) -> Result<Self, GatewayError> {
        let Value::Object(mut fields) = payload else {
            return Err(GatewayError::InvalidPayload(
                "plugin payload must be a JSON object".to_owned(),
            ));
        };
        fields.remove("janus");
        fields.remove("transaction");

        let mut env = Self::new(RequestKind::Message);
        env.fields = fields;
        Ok(env)
    }

    pub fn detach() -> Self {
        Self::new(RequestKind::Detach)
    }

    pub fn destroy() -> Self {
        Self::new(RequestKind::Destroy)
    }

    pub fn to_value(&self) -> Result<Value, GatewayError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Check that a synchronous reply has the expected kind (`"ack"`,
/// `"success"`).
///
/// `{"janus":"error"}` replies become [`GatewayError::Rejected`].
pub fn expect_reply(reply: &Value, expected: &'static str) -> Result<(), GatewayError> {
    let kind = ReplyKind::of(reply);
    if kind.as_str() == expected {
        return Ok(());
    }
    if kind == ReplyKind::Error {
        return Err(rejection(reply));
    }
    Err(GatewayError::UnexpectedReply {
        expected,
        got: kind.as_str().to_owned(),
    })
}

/// The `{"janus":"error","error":{"code","reason"}}` body as a
/// [`GatewayError::Rejected`].
pub fn rejection(reply: &Value) -> GatewayError {
    let err = reply.get("error");
    let code = err
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let reason = err
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("unknown reason")
        .to_owned();
    GatewayError::Rejected { code, reason }
}

/// Pull `data.id` out of a `success` reply to `create` or `attach`.
pub fn data_id(reply: &Value) -> Result<u64, GatewayError> {
    reply
        .get("data")
        .and_then(|d| d.get("id"))
        .and_then(Value::as_u64)
        .ok_or(GatewayError::MissingField("data.id"))
}

/// Session description payload exchanged with plugins.
///
/// The core never interprets it; it is decoded only for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trickle: Option<bool>,
}

impl Jsep {
    pub fn new(kind: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            sdp: sdp.into(),
            trickle: Some(false),
        }
    }
}

/// A plugin event delivered through the long-poll, as returned by `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent(Value);

impl GatewayEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn transaction(&self) -> Option<&str> {
        self.0.get("transaction").and_then(Value::as_str)
    }

    pub fn sender(&self) -> Option<u64> {
        self.0.get("sender").and_then(Value::as_u64)
    }

    /// `plugindata.data`, where plugins put their actual answer.
    pub fn plugin_data(&self) -> Option<&Value> {
        self.0.get("plugindata").and_then(|p| p.get("data"))
    }

    pub fn jsep(&self) -> Option<Jsep> {
        self.0
            .get("jsep")
            .and_then(|j| serde_json::from_value(j.clone()).ok())
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Deref for GatewayEvent {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}
