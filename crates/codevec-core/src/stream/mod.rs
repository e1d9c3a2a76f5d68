//! Session broadcast channels.

pub mod model;

use codevec_redis::Broker;

use crate::error::CodevecResult;
use model::{Notice, StreamEvent};

/// Prefix of every session channel.
pub const CHANNEL_PREFIX: &str = "stream:";

/// Name of the broadcast channel for a session.
pub fn channel_name(session_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, session_id)
}

/// Publish a stream event on a session's channel.
pub async fn publish_event(
    broker: &dyn Broker,
    session_id: &str,
    event: &StreamEvent,
) -> CodevecResult<()> {
    broker
        .publish(&channel_name(session_id), &event.to_json()?)
        .await?;
    Ok(())
}

/// Publish a diagnostic notice on a session's channel.
pub async fn publish_notice(
    broker: &dyn Broker,
    session_id: &str,
    notice: &Notice,
) -> CodevecResult<()> {
    broker
        .publish(&channel_name(session_id), &notice.to_json()?)
        .await?;
    Ok(())
}
