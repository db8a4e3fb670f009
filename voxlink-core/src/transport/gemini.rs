//! Gemini Live over WebSocket.
//!
//! `connect` runs the handshake (socket upgrade, `setup`, wait for
//! `setupComplete`) and then hands the socket to a spawned I/O task that
//! pumps the [`LinkPeer`] until either side closes.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, VoiceError},
    transport::{
        messages::{ClientMessage, ServerMessage},
        Connector, LinkPeer, OpenFuture, OpenRequest, ServerEvent, SessionLink,
    },
};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct GeminiLiveConfig {
    pub api_key: String,
    pub endpoint: String,
    /// Bound on socket upgrade + `setupComplete`.
    pub connect_timeout: Duration,
}

impl Default for GeminiLiveConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl GeminiLiveConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}

pub struct GeminiLiveConnector {
    config: GeminiLiveConfig,
}

impl GeminiLiveConnector {
    pub fn new(config: GeminiLiveConfig) -> Self {
        Self { config }
    }
}

impl Connector for GeminiLiveConnector {
    fn connect(&self, request: OpenRequest) -> OpenFuture {
        let config = self.config.clone();
        Box::pin(async move {
            if config.api_key.trim().is_empty() {
                return Err(VoiceError::TransportOpen("missing API key".into()));
            }
            let ws = tokio::time::timeout(config.connect_timeout, handshake(&config, &request))
                .await
                .map_err(|_| {
                    VoiceError::TransportOpen(format!(
                        "handshake timed out after {:?}",
                        config.connect_timeout
                    ))
                })??;

            let (link, peer) = SessionLink::channel();
            tokio::spawn(run_connection(ws, peer));
            Ok(link)
        })
    }
}

async fn handshake(config: &GeminiLiveConfig, request: &OpenRequest) -> Result<WsStream> {
    let (mut ws, _response) = connect_async(config.url())
        .await
        .map_err(|e| VoiceError::TransportOpen(e.to_string()))?;
    info!(model = %request.model, "connected to Gemini Live");

    let setup = serde_json::to_string(&ClientMessage::setup(request))
        .map_err(|e| VoiceError::TransportOpen(e.to_string()))?;
    ws.send(Message::Text(setup.into()))
        .await
        .map_err(|e| VoiceError::TransportOpen(e.to_string()))?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| VoiceError::TransportOpen(e.to_string()))?;
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if parse_frame(&msg).is_some_and(|m| m.is_setup_complete()) {
                    debug!("setupComplete received");
                    return Ok(ws);
                }
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed during setup".into());
                return Err(VoiceError::TransportOpen(reason));
            }
            _ => {}
        }
    }
    Err(VoiceError::TransportOpen(
        "connection ended before setupComplete".into(),
    ))
}

fn parse_frame(msg: &Message) -> Option<ServerMessage> {
    let parsed = match msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text.as_str()),
        Message::Binary(data) => serde_json::from_slice::<ServerMessage>(data),
        _ => return None,
    };
    match parsed {
        Ok(m) => Some(m),
        Err(e) => {
            warn!("unparseable server frame: {e}");
            None
        }
    }
}

async fn run_connection(ws: WsStream, mut peer: LinkPeer) {
    let (mut sink, mut stream) = ws.split();

    let terminal = loop {
        tokio::select! {
            biased;

            _ = &mut peer.shutdown => {
                debug!("client closed link");
                let _ = sink.send(Message::Close(None)).await;
                break None;
            }

            outbound = peer.outbound.recv() => {
                let Some(chunk) = outbound else {
                    let _ = sink.send(Message::Close(None)).await;
                    break None;
                };
                let json = match serde_json::to_string(&ClientMessage::audio(chunk)) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("failed to serialize audio message: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("websocket send failed: {e}");
                    break Some(ServerEvent::Error(e.to_string()));
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        let Some(server) = parse_frame(&msg) else { continue };
                        if let Some(go_away) = &server.go_away {
                            warn!(time_left = ?go_away.time_left, "server sent goAway");
                        }
                        for event in server.into_events() {
                            if peer.events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            error!("failed to send pong: {e}");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        info!(?reason, "websocket closed by server");
                        break Some(ServerEvent::Closed { reason });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("websocket error: {e}");
                        break Some(ServerEvent::Error(e.to_string()));
                    }
                    None => break Some(ServerEvent::Closed { reason: None }),
                }
            }
        }
    };

    if let Some(event) = terminal {
        let _ = peer.events.send(event);
    }
    debug!("Gemini Live connection task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ResponseModality;

    #[test]
    fn url_appends_key() {
        let config = GeminiLiveConfig::with_api_key("abc");
        assert!(config.url().starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(config.url().ends_with("BidiGenerateContent?key=abc"));

        let custom = GeminiLiveConfig {
            endpoint: "ws://localhost:9000/live?v=1".into(),
            ..GeminiLiveConfig::with_api_key("k")
        };
        assert_eq!(custom.url(), "ws://localhost:9000/live?v=1&key=k");
    }

    #[test]
    fn binary_frames_parse_like_text() {
        let raw = r#"{"setupComplete":{}}"#;
        let text = parse_frame(&Message::Text(raw.into())).expect("text frame");
        let binary = parse_frame(&Message::Binary(raw.as_bytes().to_vec().into()))
            .expect("binary frame");
        assert!(text.is_setup_complete());
        assert!(binary.is_setup_complete());
        assert!(parse_frame(&Message::Text("not json".into())).is_none());
    }

    #[tokio::test]
    async fn missing_api_key_fails_open() {
        let connector = GeminiLiveConnector::new(GeminiLiveConfig::default());
        let request = OpenRequest {
            model: "m".into(),
            system_instruction: String::new(),
            response_modality: ResponseModality::Audio,
            output_transcription: true,
            voice: None,
        };
        let err = connector.connect(request).await.err().expect("must fail");
        assert!(matches!(err, VoiceError::TransportOpen(_)));
    }
}
