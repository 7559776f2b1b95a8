//! HTTPS accept loop over the hot-swappable configuration

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::hot_swap::LiveTlsConfig;

/// Upper bound on a single TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts TLS connections using whichever configuration is live at accept time
pub struct HttpsListener {
    listener: TcpListener,
    live: Arc<ArcSwap<LiveTlsConfig>>,
}

impl HttpsListener {
    pub async fn bind(addr: SocketAddr, live: Arc<ArcSwap<LiveTlsConfig>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "HTTPS listener bound");
        Ok(Self { listener, live })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips to `true` or its sender drops
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let config = self.live.load_full();
                        tokio::spawn(handle_connection(stream, peer, config));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept HTTPS connection");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("HTTPS listener stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, config: Arc<LiveTlsConfig>) {
    let generation = config.generation();
    let handshake = config.handshakes().begin();

    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, config.acceptor().accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(peer = %peer, generation = generation, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, generation = generation, "TLS handshake timed out");
            return;
        }
    };
    drop(handshake);
    // The connection keeps its own reference to the negotiated session
    drop(config);

    trace!(peer = %peer, generation = generation, "TLS handshake completed");

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service_fn(respond))
        .await
    {
        debug!(peer = %peer, error = %e, "HTTPS connection ended with error");
    }
}

async fn respond(_request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"OK\n")));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    Ok(response)
}
