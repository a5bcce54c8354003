//! Video-room negotiation on top of the signaling core.
//!
//! Media capture, peer connections and SDP generation are not done here;
//! they sit behind [`Negotiator`]. This module only knows the video-room
//! request bodies and which jsep goes where.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use janus_client::{GatewayEvent, Jsep, PluginHandle, Session};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// A feed published in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: u64,
    #[serde(default)]
    pub display: Option<String>,
}

/// What a publisher offers to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
    pub data: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
            data: true,
        }
    }
}

/// The peer-connection side of a negotiation.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Produce a local offer for the given media.
    async fn create_offer(&self, media: &MediaRequest) -> Result<Jsep>;

    /// Apply the gateway's answer to our offer.
    async fn apply_answer(&self, answer: Jsep) -> Result<()>;

    /// Apply the gateway's offer and produce our answer.
    async fn create_answer(&self, offer: Jsep) -> Result<Jsep>;
}

/// A video-room plugin handle bound to one room.
#[derive(Debug, Clone)]
pub struct VideoRoom {
    handle: PluginHandle,
    room: u64,
    reply_timeout: Duration,
}

impl VideoRoom {
    /// Attach a fresh video-room handle for `room`.
    pub async fn attach(session: &Session, room: u64, reply_timeout: Duration) -> Result<Self> {
        let handle = session
            .attach(VIDEOROOM_PLUGIN)
            .await
            .context("attaching video-room plugin")?;
        Ok(Self {
            handle,
            room,
            reply_timeout,
        })
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    pub fn room(&self) -> u64 {
        self.room
    }

    /// Join as a publisher and return the feeds already in the room.
    pub async fn join_as_publisher(&self, display: &str) -> Result<Vec<Publisher>> {
        let event = self
            .call(json!({
                "body": {
                    "request": "join",
                    "ptype": "publisher",
                    "room": self.room,
                    "display": display,
                }
            }))
            .await?;
        let data = room_data(&event)?;
        let publishers = match data.get("publishers") {
            Some(list) => serde_json::from_value(list.clone()).context("decoding publishers")?,
            None => vec![],
        };
        info!(room = self.room, count = publishers.len(), "joined room as publisher");
        Ok(publishers)
    }

    /// Offer our media to the room and apply the gateway's answer.
    pub async fn publish(&self, negotiator: &dyn Negotiator, media: MediaRequest) -> Result<()> {
        let offer = negotiator.create_offer(&media).await?;
        let mut body = json!({"request": "configure"});
        merge(&mut body, serde_json::to_value(media)?);

        let event = self
            .call(json!({"body": body, "jsep": offer_jsep(offer)}))
            .await?;
        room_data(&event)?;
        let answer = event
            .jsep()
            .ok_or_else(|| anyhow!("configure reply carried no jsep"))?;
        negotiator.apply_answer(answer).await?;
        info!(room = self.room, "publishing");
        Ok(())
    }

    /// Everyone currently in the room, publishing or not.
    pub async fn list_participants(&self) -> Result<Vec<Publisher>> {
        let reply = self
            .handle
            .request(json!({"body": {"request": "listparticipants", "room": self.room}}))
            .await
            .context("listing participants")?;
        let participants = match room_data(&reply)?.get("participants") {
            Some(list) => serde_json::from_value(list.clone()).context("decoding participants")?,
            None => vec![],
        };
        Ok(participants)
    }

    async fn call(&self, payload: Value) -> Result<GatewayEvent> {
        debug!(plugin_id = self.handle.id(), %payload, "video-room request");
        call_with_deadline(&self.handle, payload, self.reply_timeout).await
    }
}

/// Subscribe to `feed` on a new handle and complete the negotiation.
pub async fn subscribe(
    session: &Session,
    room: u64,
    feed: u64,
    negotiator: &dyn Negotiator,
    reply_timeout: Duration,
) -> Result<PluginHandle> {
    let handle = session
        .attach(VIDEOROOM_PLUGIN)
        .await
        .context("attaching subscriber handle")?;

    let event = call_with_deadline(
        &handle,
        json!({"body": {"request": "join", "ptype": "subscriber", "room": room, "feed": feed}}),
        reply_timeout,
    )
    .await?;
    room_data(&event)?;
    let offer = event
        .jsep()
        .ok_or_else(|| anyhow!("subscriber join carried no offer"))?;

    let answer = negotiator.create_answer(offer).await?;
    let event = call_with_deadline(
        &handle,
        json!({"body": {"request": "start"}, "jsep": offer_jsep(answer)}),
        reply_timeout,
    )
    .await?;
    room_data(&event)?;
    info!(room, feed, plugin_id = handle.id(), "subscribed to feed");
    Ok(handle)
}

/// `send` bounded by `deadline`.
///
/// A reply that lands after the deadline stays in the handle's inbox, so it
/// is discarded before the next call goes out. If it lands while that next
/// call is already waiting, the call fails with a transaction mismatch.
async fn call_with_deadline(
    handle: &PluginHandle,
    payload: Value,
    deadline: Duration,
) -> Result<GatewayEvent> {
    let stale = handle.discard_stale();
    if stale > 0 {
        warn!(plugin_id = handle.id(), stale, "dropped late replies to timed-out requests");
    }
    timeout(deadline, handle.send(payload))
        .await
        .map_err(|_| anyhow!("no reply from plugin {} within {:?}", handle.id(), deadline))?
        .map_err(Into::into)
}

/// `plugindata.data`, failing on video-room level errors.
fn room_data(event: &GatewayEvent) -> Result<&Value> {
    let data = event
        .plugin_data()
        .ok_or_else(|| anyhow!("reply carried no plugindata"))?;
    if let Some(reason) = data.get("error") {
        let code = data.get("error_code").and_then(Value::as_i64).unwrap_or_default();
        bail!("video-room error {code}: {}", reason.as_str().unwrap_or_default());
    }
    Ok(data)
}

/// Jsep as sent to the gateway: trickle is always off, candidates are in the SDP.
fn offer_jsep(mut jsep: Jsep) -> Jsep {
    jsep.trickle = Some(false);
    jsep
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        target.extend(extra);
    }
}
