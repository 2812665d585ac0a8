//! Listener for the observability endpoints.

use crate::admin::AdminService;
use crate::error::{GatewayError, Result};
use crate::observability::Metrics;
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

/// Serves `/health`, `/metrics`, and `/stats` on a port separate from
/// tenant traffic, so probes and scrapes survive a data-plane overload.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin socket.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(metrics))]
    pub async fn bind(addr: &str, metrics: Arc<Metrics>) -> Result<Self> {
        let bind_err = |source| GatewayError::ListenerBind {
            addr: addr.to_string(),
            source,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, "observability endpoints bound");

        Ok(Self {
            tcp_listener,
            admin_service: AdminService::new(metrics),
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Answers probes and scrapes until asked to stop.
    ///
    /// Admin traffic is a trickle of short-lived requests, so each
    /// connection is served in its own task with no further bookkeeping.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("stop requested, admin listener draining");
                    return Ok(());
                }
                conn = self.tcp_listener.accept() => {
                    let (stream, scraper) = match conn {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "could not accept admin connection");
                            continue;
                        }
                    };

                    let service = self.admin_service.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: Request<Incoming>| {
                            let mut service = service.clone();
                            async move { service.call(req).await }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(peer = %scraper, error = %e, "admin connection ended early");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0", Arc::new(Metrics::new())).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let listener = AdminListener::bind("999.999.999.999:0", Arc::new(Metrics::new())).await;
        assert!(listener.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_stops_on_signal() {
        let listener = AdminListener::bind("127.0.0.1:0", Arc::new(Metrics::new()))
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let server = tokio::spawn(async move { listener.serve(shutdown_rx).await });
        shutdown_tx.send(()).unwrap();

        let joined = tokio::time::timeout(std::time::Duration::from_secs(1), server).await;
        assert!(joined.is_ok());
    }
}
