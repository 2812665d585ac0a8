//! Data-plane TCP listener.

use crate::error::{GatewayError, Result};
use crate::pipeline::{GatewayService, GatewayState};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Accepts tenant traffic and hands each connection to the request
/// pipeline.
///
/// Every connection gets its own [`GatewayService`] carrying the peer
/// address, which the pipeline needs for client-ip rate limiting and
/// `X-Forwarded-For` chaining. A broadcast signal stops the accept loop.
pub struct Listener {
    tcp_listener: TcpListener,
    state: Arc<GatewayState>,
    addr: SocketAddr,
}

impl Listener {
    /// Binds the data-plane socket.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(state))]
    pub async fn bind(addr: &str, state: Arc<GatewayState>) -> Result<Self> {
        let bind_err = |source| GatewayError::ListenerBind {
            addr: addr.to_string(),
            source,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, "data plane bound");

        Ok(Self {
            tcp_listener,
            state,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts tenant connections until asked to stop.
    ///
    /// Accept errors are transient (file-descriptor pressure, aborted
    /// handshakes) and never tear the loop down; the stop signal is the
    /// only clean exit.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("accepting tenant traffic");
        let mut accepted: u64 = 0;

        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!(connections = accepted, "stop requested, gateway listener draining");
                    return Ok(());
                }
                conn = self.tcp_listener.accept() => match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "could not accept gateway connection");
                        continue;
                    }
                },
            };

            accepted += 1;
            let service = GatewayService::new(Arc::clone(&self.state), peer_addr);
            tokio::spawn(async move {
                debug!(peer = %peer_addr, "gateway connection open");
                if let Err(e) = serve_http1(stream, service).await {
                    // Covers client disconnects as well as protocol errors.
                    debug!(peer = %peer_addr, error = %e, "gateway connection ended");
                }
            });
        }
    }
}

/// Drives one HTTP/1.1 connection through the request pipeline.
async fn serve_http1(stream: tokio::net::TcpStream, service: GatewayService) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let mut service = service.clone();
        async move { service.call(req).await }
    });

    http1::Builder::new()
        .serve_connection(io, service)
        .await
        .map_err(GatewayError::Http)
}
