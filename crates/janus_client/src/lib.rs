//! Client side of the Janus WebRTC gateway HTTP API.
//!
//! A [`Session`] creates a gateway session, attaches [`PluginHandle`]s and
//! long-polls the gateway for events. `PluginHandle::send` posts a plugin
//! message and waits until the poll loop routes back the event carrying
//! the same transaction.
//!
//! ```ignore
//! let mut session = Session::new("http://localhost:8088/janus");
//! session.create().await?;
//! let echo = session.attach("janus.plugin.echotest").await?;
//! let reply = echo.send(json!({"body": {"audio": true}})).await?;
//! session.destroy().await?;
//! ```

pub mod envelope;
pub mod error;
pub mod event_queue;
pub mod plugin;
pub mod session;
pub mod transaction;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use envelope::{GatewayEvent, Jsep};
pub use error::GatewayError;
pub use plugin::PluginHandle;
pub use session::{Session, SessionConfig, SessionState};
pub use transport::{GatewayTransport, ReqwestTransport};
