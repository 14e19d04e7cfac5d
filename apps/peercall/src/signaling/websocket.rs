use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future, stream};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use url::Url;

use super::{Connector, FrameSink, FrameStream};
use crate::error::CallError;

/// Dials the relay over `ws://` / `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn dial(&self, url: &Url) -> Result<(FrameSink, FrameStream), CallError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| CallError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "peercall::signaling", url = %url, "signaling websocket connected");
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|err| CallError::Transport(err.to_string()))
            .with(|text: String| future::ready(Ok::<_, CallError>(Message::Text(text))));

        let frames = stream::unfold(read, |mut read| async move {
            loop {
                match read.next().await? {
                    Ok(Message::Text(text)) => return Some((Ok(text), read)),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => return Some((Ok(text), read)),
                        Err(_) => {
                            tracing::warn!(
                                target = "peercall::signaling",
                                "skipping non-utf8 binary frame"
                            );
                        }
                    },
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {}
                    Err(
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                    ) => return None,
                    Err(err) => return Some((Err(CallError::Transport(err.to_string())), read)),
                }
            }
        });

        let sink: FrameSink = Box::pin(sink);
        let frames: FrameStream = Box::pin(frames);
        Ok((sink, frames))
    }
}
