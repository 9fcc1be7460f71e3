//! Stream Transport
//!
//! A session talks to its peer through a [`Transport`]: something that can
//! open one bidirectional byte stream and be closed with an error code.
//! [`WsTransport`] carries that byte stream over WebSocket binary messages.

use std::borrow::Cow;
use std::io;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Close code sent when the peer's stream ended normally.
pub const CLOSE_STREAM_ENDED: u16 = 3000;

/// Close code sent when a session fails to start.
pub const CLOSE_START_FAILED: u16 = 500;

/// Size of the in-process pipe between the socket pump and the session.
const PIPE_SIZE: usize = 64 * 1024;

/// A bidirectional async byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed stream handed to sessions.
pub type BoxStream = Box<dyn ByteStream>;

/// A connection that yields one control stream.
pub trait Transport: Send + Sync + 'static {
    /// Open the bidirectional control stream.
    fn open_stream(&self) -> BoxFuture<'_, io::Result<BoxStream>>;

    /// Close the underlying connection with an application error code.
    fn close_with_error(&self, code: u16, reason: &str);
}

// =============================================================================
// WEBSOCKET
// =============================================================================

type CloseRequest = (u16, String);

/// Transport over an accepted or dialed WebSocket.
///
/// Binary messages are concatenated into a byte stream. Writes on the stream
/// leave as binary messages of whatever size the pipe hands over.
pub struct WsTransport<S> {
    socket: Mutex<Option<WebSocketStream<S>>>,
    close_tx: Mutex<Option<oneshot::Sender<CloseRequest>>>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap a WebSocket whose handshake already completed.
    pub fn new(socket: WebSocketStream<S>) -> Self {
        Self {
            socket: Mutex::new(Some(socket)),
            close_tx: Mutex::new(None),
        }
    }

    fn take_socket(&self) -> Option<WebSocketStream<S>> {
        self.socket.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn open_stream(&self) -> BoxFuture<'_, io::Result<BoxStream>> {
        Box::pin(async move {
            let socket = self
                .take_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream already opened"))?;

            let (session_side, pump_side) = tokio::io::duplex(PIPE_SIZE);
            let (close_tx, close_rx) = oneshot::channel();
            if let Ok(mut slot) = self.close_tx.lock() {
                *slot = Some(close_tx);
            }

            tokio::spawn(pump(socket, pump_side, close_rx));
            Ok(Box::new(session_side) as BoxStream)
        })
    }

    fn close_with_error(&self, code: u16, reason: &str) {
        let request = (code, reason.to_string());

        let pending = self.close_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = pending {
            let _ = tx.send(request);
            return;
        }

        // Never opened: close the socket directly
        if let Some(mut socket) = self.take_socket() {
            tokio::spawn(async move {
                let _ = socket.close(Some(close_frame(request))).await;
            });
        }
    }
}

fn close_frame((code, reason): CloseRequest) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason),
    }
}

/// Shuttle bytes between the socket and the session's end of the pipe.
async fn pump<S>(
    socket: WebSocketStream<S>,
    pipe: tokio::io::DuplexStream,
    mut close_rx: oneshot::Receiver<CloseRequest>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe);
    let mut buf = vec![0u8; PIPE_SIZE];
    let mut close_request = None;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if pipe_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer closed socket: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read error: {}", e);
                    break;
                }
                None => break,
            },
            read = pipe_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    close_request = Some((CLOSE_STREAM_ENDED, "stream closed".to_string()));
                    break;
                }
                Ok(n) => {
                    if let Err(e) = sink.send(Message::Binary(buf[..n].to_vec())).await {
                        warn!("Socket write error: {}", e);
                        break;
                    }
                }
            },
            request = &mut close_rx => {
                close_request = request.ok();
                break;
            }
        }
    }

    if let Some(request) = close_request {
        let _ = sink.send(Message::Close(Some(close_frame(request)))).await;
    }
    let _ = sink.close().await;
    let _ = pipe_write.shutdown().await;
}

// =============================================================================
// IN-MEMORY TRANSPORT
// =============================================================================
