//! WebSocket transport adapter.
//!
//! Bridges a [`TransportLink`] to `tokio-tungstenite`. The client side
//! ([`WebSocketTransport::spawn`]) dials on `Connect`/`Reconnect` and keeps
//! at most one socket at a time; the accepting side ([`serve`]) drives a
//! socket that is already open.
//!
//! Only text frames carry data. Binary frames are accepted when they hold
//! UTF-8; WebSocket-level ping/pong frames are left to tungstenite.

// ============================================================================
// Imports
// ============================================================================

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::link::{AdapterEnd, Directive, Signal, TransportLink, link};

// ============================================================================
// Types
// ============================================================================

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Client-side WebSocket adapter.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Spawns an adapter task dialing `url` and returns the core side of its
    /// link.
    ///
    /// `http` and `https` URLs are dialed as `ws` and `wss`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the scheme is not a WebSocket or HTTP scheme
    /// - [`Error::Config`] if no tokio runtime is running
    pub fn spawn(url: Url) -> Result<TransportLink> {
        let url = websocket_url(url)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::config("the WebSocket transport needs a tokio runtime"))?;

        let (core, adapter) = link();
        runtime.spawn(run_client(url, adapter));
        Ok(core)
    }
}

/// Normalizes an endpoint URL to a WebSocket scheme.
fn websocket_url(mut url: Url) -> Result<Url> {
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(Error::config(format!(
                "unsupported URL scheme '{other}', expected ws, wss, http or https"
            )));
        }
    };

    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| Error::config(format!("cannot use scheme {scheme} for {url}")))?;
    }
    Ok(url)
}

// ============================================================================
// Client Loop
// ============================================================================

async fn run_client(url: Url, adapter: AdapterEnd) {
    let (mut directives, signals) = adapter.into_parts();
    let mut socket: Option<ClientSocket> = None;

    loop {
        tokio::select! {
            directive = directives.recv() => {
                match directive {
                    Some(Directive::Connect | Directive::Reconnect) => {
                        close(&mut socket).await;
                        debug!(url = %url, "Dialing");
                        match connect_async(url.as_str()).await {
                            Ok((stream, _response)) => {
                                socket = Some(stream);
                                let _ = signals.send(Signal::Connected);
                            }
                            Err(e) => {
                                debug!(url = %url, error = %e, "Dial failed");
                                let _ = signals.send(Signal::Errored(Error::from(e)));
                                let _ = signals.send(Signal::Disconnected);
                            }
                        }
                    }

                    Some(Directive::Send(frame)) => {
                        let Some(stream) = socket.as_mut() else {
                            trace!("Frame dropped, no socket");
                            continue;
                        };
                        if let Err(e) = stream.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "WebSocket send failed");
                            socket = None;
                            let _ = signals.send(Signal::Errored(Error::from(e)));
                            let _ = signals.send(Signal::Disconnected);
                        }
                    }

                    Some(Directive::Disconnect) => close(&mut socket).await,

                    None => {
                        close(&mut socket).await;
                        break;
                    }
                }
            }

            message = next_message(&mut socket) => {
                if let Some(signal) = incoming(message) {
                    if matches!(signal, Signal::Disconnected | Signal::Errored(_)) {
                        socket = None;
                    }
                    let closed = matches!(signal, Signal::Errored(_));
                    let _ = signals.send(signal);
                    if closed {
                        let _ = signals.send(Signal::Disconnected);
                    }
                }
            }
        }
    }

    debug!(url = %url, "WebSocket adapter terminated");
}

async fn next_message(socket: &mut Option<ClientSocket>) -> Option<std::result::Result<Message, WsError>> {
    match socket {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn close(socket: &mut Option<ClientSocket>) {
    if let Some(mut stream) = socket.take() {
        let _ = stream.close(None).await;
    }
}

// ============================================================================
// Accepted Sockets
// ============================================================================

/// Drives an accepted WebSocket until either side closes it.
///
/// Reports `Connected` immediately. `Connect` and `Reconnect` directives
/// are meaningless for an accepted socket and are ignored.
pub async fn serve<S>(stream: WebSocketStream<S>, adapter: AdapterEnd)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut directives, signals) = adapter.into_parts();
    let (mut write, mut read) = stream.split();
    let _ = signals.send(Signal::Connected);

    loop {
        tokio::select! {
            directive = directives.recv() => {
                match directive {
                    Some(Directive::Send(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "WebSocket send failed");
                            let _ = signals.send(Signal::Errored(Error::from(e)));
                            let _ = signals.send(Signal::Disconnected);
                            break;
                        }
                    }
                    Some(Directive::Disconnect) | None => {
                        let _ = write.close().await;
                        break;
                    }
                    Some(Directive::Connect | Directive::Reconnect) => {
                        trace!("Dial directive ignored on accepted socket");
                    }
                }
            }

            message = read.next() => {
                match incoming(message) {
                    Some(Signal::Errored(e)) => {
                        let _ = signals.send(Signal::Errored(e));
                        let _ = signals.send(Signal::Disconnected);
                        break;
                    }
                    Some(Signal::Disconnected) => {
                        let _ = signals.send(Signal::Disconnected);
                        break;
                    }
                    Some(signal) => {
                        let _ = signals.send(signal);
                    }
                    None => {}
                }
            }
        }
    }

    debug!("Accepted socket closed");
}

// ============================================================================
// Frames
// ============================================================================

/// Maps a stream item to the signal it produces, if any.
fn incoming(message: Option<std::result::Result<Message, WsError>>) -> Option<Signal> {
    match message {
        Some(Ok(Message::Text(text))) => Some(Signal::Message(text.to_string())),
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Signal::Message(text)),
            Err(_) => {
                warn!(len = bytes.len(), "Non UTF-8 binary frame dropped");
                None
            }
        },
        Some(Ok(Message::Close(frame))) => {
            debug!(?frame, "WebSocket closed by remote");
            Some(Signal::Disconnected)
        }
        Some(Ok(_)) => None,
        Some(Err(e)) => Some(Signal::Errored(Error::from(e))),
        None => Some(Signal::Disconnected),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_schemes_map_to_websocket() {
        let url = websocket_url(Url::parse("http://localhost:8080/live").expect("url")).expect("ws");
        assert_eq!(url.as_str(), "ws://localhost:8080/live");

        let url = websocket_url(Url::parse("https://example.com").expect("url")).expect("wss");
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_websocket_schemes_kept() {
        let url = websocket_url(Url::parse("wss://example.com/a?b=c").expect("url")).expect("wss");
        assert_eq!(url.as_str(), "wss://example.com/a?b=c");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let err = websocket_url(Url::parse("ftp://example.com").expect("url")).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_text_frame_becomes_message() {
        let signal = incoming(Some(Ok(Message::Text("hi".into()))));
        assert!(matches!(signal, Some(Signal::Message(raw)) if raw == "hi"));
    }

    #[test]
    fn test_end_of_stream_is_disconnect() {
        assert!(matches!(incoming(None), Some(Signal::Disconnected)));
    }

    #[test]
    fn test_control_frames_ignored() {
        assert!(incoming(Some(Ok(Message::Ping(Default::default())))).is_none());
    }

    #[tokio::test]
    async fn test_dial_failure_reports_error_then_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let url = Url::parse(&format!("ws://127.0.0.1:{port}")).expect("url");
        let mut core = WebSocketTransport::spawn(url).expect("spawn");
        assert!(core.direct(Directive::Connect));

        assert!(matches!(core.signals.recv().await, Some(Signal::Errored(_))));
        assert!(matches!(core.signals.recv().await, Some(Signal::Disconnected)));
    }
}
