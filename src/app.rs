use anyhow::{Context, Result};
use janus_client::Session;
use tracing::info;

use crate::{
    config::ClientConfig,
    videoroom::{Publisher, VideoRoom},
};

/// Create the session, join the room as a publisher, report who is
/// already publishing, then hold the session open for `config.hold`.
///
/// Tearing the session down is left to the caller so it also happens on
/// error or interruption.
pub async fn run(config: &ClientConfig, session: &mut Session) -> Result<Vec<Publisher>> {
    session
        .create()
        .await
        .with_context(|| format!("creating session on {}", session.root_url()))?;

    let room = VideoRoom::attach(session, config.room, config.reply_timeout).await?;
    let publishers = room.join_as_publisher(&config.display).await?;
    for publisher in &publishers {
        println!(
            "id: {}, display: {}",
            publisher.id,
            publisher.display.as_deref().unwrap_or("-")
        );
    }

    info!(hold_secs = config.hold.as_secs(), "holding session open");
    tokio::time::sleep(config.hold).await;
    Ok(publishers)
}
