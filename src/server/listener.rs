//! WebSocket accept loop.
//!
//! Binds a TCP listener, upgrades every inbound socket with
//! `tokio-tungstenite`, captures the handshake headers and query, and hands
//! the socket to [`Server::accept`] through a fresh transport link.
//!
//! # Connection Flow
//!
//! 1. `Server::listen` binds and spawns the accept loop
//! 2. Each TCP connection is upgraded on its own task
//! 3. Headers and query parameters become a [`SparkInfo`]
//! 4. The socket is driven by [`serve`] until either side closes it

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{link, serve};

use super::{Server, ServerInner, SparkInfo};

// ============================================================================
// Server - Listening
// ============================================================================

impl Server {
    /// Binds `addr` and accepts WebSocket connections on it.
    ///
    /// Returns the bound address, useful when binding port 0. The accept
    /// loop runs until [`destroy`](Server::destroy) or until every server
    /// handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let task = tokio::spawn(accept_loop(listener, Arc::downgrade(&self.inner)));
        self.inner.listeners.lock().push(task);

        info!(addr = %local, "Server listening");
        Ok(local)
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(listener: TcpListener, server: Weak<ServerInner>) {
    loop {
        let accepted = listener.accept().await;

        let Some(inner) = server.upgrade() else {
            debug!("Server dropped, accept loop stopping");
            break;
        };
        let server = Server { inner };

        match accepted {
            Ok((stream, address)) => {
                debug!(%address, "TCP connection accepted");
                tokio::spawn(async move {
                    if let Err(e) = upgrade(&server, stream, address).await {
                        server.safe_error(e);
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                server.safe_error(Error::from(e));
            }
        }
    }
}

async fn upgrade(server: &Server, stream: TcpStream, address: SocketAddr) -> Result<()> {
    let mut info = SparkInfo::new(address);

    let capture = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        info.headers = headers(request);
        info.query = query(request);
        Ok(response)
    };

    let socket = accept_hdr_async(stream, capture)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    if let Some(id) = info.query.get("id") {
        info.id = Some(id.as_str().into());
    }

    let (core, adapter) = link();
    let spark = server.accept(info, core)?;
    debug!(id = %spark.id(), "WebSocket connection established");

    serve(socket, adapter).await;
    Ok(())
}

// ============================================================================
// Handshake
// ============================================================================

fn headers(request: &Request) -> FxHashMap<String, String> {
    request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_owned()))
        })
        .collect()
}

fn query(request: &Request) -> FxHashMap<String, String> {
    request
        .uri()
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
