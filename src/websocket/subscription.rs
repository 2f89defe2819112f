//! The subscription message sent once, right after the connection opens.

use futures_util::SinkExt;
use tracing::{debug, info};
use tungstenite::Message;

use super::WsWriter;
use crate::Result;
use crate::models::SubscribeRequest;

/// Sends `request` on the connection.
///
/// # Errors
///
/// Returns a [`RollbookError`](crate::RollbookError) if serializing or
/// sending the subscription message fails.
pub async fn subscribe(write: &mut WsWriter, request: &SubscribeRequest) -> Result<()> {
    let json = serde_json::to_string(request)?;
    debug!("Sending subscribe request: {}", json);
    write.send(Message::Text(json.into())).await?;
    info!(channel = request.channel().as_str(), "Subscribed to channel");

    Ok(())
}
