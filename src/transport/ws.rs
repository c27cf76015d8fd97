use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::stream::client::StreamClientError;
use crate::transport::{bearer_value, FrameStream, OpenRequest, Transport};

/// Websocket transport: each text message is one frame.
///
/// Binary frames are ignored. A close frame ends the stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, request: OpenRequest) -> Result<FrameStream, StreamClientError> {
        let mut ws_request = request.url.as_str().into_client_request()?;
        if let Some(token) = &request.token {
            let mut value = HeaderValue::from_str(&bearer_value(token))
                .map_err(|_| StreamClientError::InvalidToken)?;
            value.set_sensitive(true);
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = connect_async(ws_request).await?;
        debug!(
            event = "ws_handshake_complete",
            status = response.status().as_u16()
        );

        let frames = stream::unfold(Some(socket), |state| async move {
            let mut socket = state?;
            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), Some(socket))),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return Some((Err(StreamClientError::WebSocket(err)), None));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Some((Err(StreamClientError::WebSocket(err)), None)),
                }
            }
        });

        Ok(Box::pin(frames))
    }
}
