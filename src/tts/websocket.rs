//! WebSocket synthesis client.
//!
//! One connection per synthesis. The client sends a `config` frame, one
//! `text` frame per text and a final `eos` frame. The server answers with
//! binary PCM frames (or JSON `audio` frames carrying base64 data) and a
//! `done` frame. Cancelling closes the socket with status 1011 and reason
//! `cancelled`.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SpeechStream, TextStream, TtsBackend};
use crate::config::TtsConfig;
use crate::error::{Result, SpeechError};

const AUDIO_QUEUE: usize = 32;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame received from the synthesis server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Synthesized audio.
    Audio(Bytes),
    /// The server finished the request.
    Done,
    /// The server rejected or failed the request.
    Error(String),
    /// Anything else (progress, keep-alive).
    Ignored,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonFrame {
    Audio { data: String },
    Done,
    Error { message: String },
}

/// Decode a JSON text frame from the server.
pub fn parse_server_frame(text: &str) -> ServerFrame {
    match serde_json::from_str::<JsonFrame>(text) {
        Ok(JsonFrame::Audio { data }) => match STANDARD.decode(data.as_bytes()) {
            Ok(pcm) => ServerFrame::Audio(Bytes::from(pcm)),
            Err(e) => ServerFrame::Error(format!("invalid audio payload: {e}")),
        },
        Ok(JsonFrame::Done) => ServerFrame::Done,
        Ok(JsonFrame::Error { message }) => ServerFrame::Error(message),
        Err(_) => {
            debug!(frame = text, "ignoring server frame");
            ServerFrame::Ignored
        }
    }
}

/// Synthesizer speaking to a WebSocket TTS server.
#[derive(Debug)]
pub struct WebSocketTts {
    url: url::Url,
    voice: Option<String>,
    connect_timeout: Duration,
    /// Parent of every in-flight synthesis token; replaced on cancel.
    cancel: Mutex<CancellationToken>,
}

impl WebSocketTts {
    /// Build a client for `config.server_url`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the URL is invalid or not ws(s).
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let url = url::Url::parse(&config.server_url).map_err(|e| {
            SpeechError::Config(format!("invalid tts.server_url '{}': {e}", config.server_url))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SpeechError::Config(format!(
                "tts.server_url must be ws or wss, got '{}'",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            voice: config.voice.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    fn parent_token(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn open(&self, texts: TextStream, burst: bool) -> Result<SpeechStream> {
        let token = self.parent_token().child_token();
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        let socket = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(SpeechError::Tts("synthesis cancelled before connecting".into()));
            }
            connected = connect => match connected {
                Ok(Ok((socket, _response))) => socket,
                Ok(Err(e)) => return Err(SpeechError::Tts(format!("connect {}: {e}", self.url))),
                Err(_) => return Err(SpeechError::Tts(format!("connect {}: timed out", self.url))),
            },
        };
        debug!(url = %self.url, burst, "synthesis connected");

        let mut config = json!({ "type": "config" });
        if let Some(voice) = &self.voice {
            config["voice"] = json!(voice);
        }
        if burst {
            config["mode"] = json!("burst");
        }

        let (audio_tx, mut audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let session_token = token.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = drive(socket, config, texts, audio_tx, session_token).await {
                warn!(error = %e, "synthesis session failed");
            }
        });

        let guard = token.drop_guard();
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = audio_rx.recv().await {
                yield chunk;
            }
            if let Err(e) = driver.await {
                warn!(error = %e, "synthesis task panicked");
            }
        }))
    }
}

/// Pump text out and audio in until the server is done or `cancel` fires.
async fn drive(
    socket: Socket,
    config: serde_json::Value,
    texts: TextStream,
    audio: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut write, mut read) = socket.split();
    let send_err = |e| SpeechError::Tts(format!("send: {e}"));
    write
        .send(Message::Text(config.to_string()))
        .await
        .map_err(send_err)?;

    let mut texts = Some(texts);
    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Error,
                    reason: "cancelled".into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not delivered");
                }
                debug!("synthesis cancelled");
                return Ok(());
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Binary(pcm))) => Bytes::from(pcm),
                Some(Ok(Message::Text(text))) => match parse_server_frame(&text) {
                    ServerFrame::Audio(pcm) => pcm,
                    ServerFrame::Done => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!(error = %e, "close after done not delivered");
                        }
                        return Ok(());
                    }
                    ServerFrame::Error(message) => {
                        return Err(SpeechError::Tts(format!("server error: {message}")));
                    }
                    ServerFrame::Ignored => continue,
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SpeechError::Tts(format!("receive: {e}"))),
            },
            text = next_text(&mut texts) => {
                let frame = match text {
                    Some(text) => json!({ "type": "text", "text": text }),
                    None => {
                        texts = None;
                        json!({ "type": "eos" })
                    }
                };
                write.send(Message::Text(frame.to_string())).await.map_err(send_err)?;
                continue;
            }
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            sent = audio.send(chunk) => {
                if sent.is_err() {
                    cancel.cancel();
                }
            }
        }
    }
}

/// Next text to send; pending forever once the text stream has ended.
async fn next_text(texts: &mut Option<TextStream>) -> Option<String> {
    match texts {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl TtsBackend for WebSocketTts {
    async fn synthesize_stream(&self, texts: TextStream) -> Result<SpeechStream> {
        self.open(texts, false).await
    }

    async fn synthesize_once(&self, text: &str) -> Result<SpeechStream> {
        let texts: TextStream = Box::pin(futures_util::stream::iter([text.to_owned()]));
        self.open(texts, true).await
    }

    async fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.parent_token(), CancellationToken::new());
        previous.cancel();
    }
}
