//! Accept loop, per-connection tasks and shutdown.
//!
//! A shutdown signal stops the accept loop at once. Connections already
//! open keep being served until they close; only then does
//! [`Server::serve`] return. A background task sweeps expired rate-limit
//! buckets once per window for as long as the server runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::app::App;
use crate::error::Error;

/// Serves an [`App`] over TCP, HTTP/1.1 and HTTP/2.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Nothing is bound until [`serve`](Server::serve).
    pub fn bind(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Binds, then serves until SIGTERM or Ctrl-C and every open
    /// connection has finished.
    pub async fn serve(self, app: App) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "invoicer listening");
        self.serve_on(listener, app, shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves.
    pub async fn serve_on(
        self,
        listener: TcpListener,
        app: App,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), Error> {
        let app = Arc::new(app);
        let sweeper = app.rate_limiter().map(|limiter| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(limiter.window());
                loop {
                    interval.tick().await;
                    let removed = limiter.sweep(Instant::now());
                    if removed > 0 {
                        debug!(removed, remaining = limiter.tracked_keys(), "rate-limit buckets swept");
                    }
                }
            })
        });

        // JoinSet tracks every connection task so shutdown can wait for them.
        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting at once,
                // even with connections queued.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move {
                                let res = app.dispatch(req, remote_addr).await;
                                Ok::<_, std::convert::Infallible>(res.into_inner())
                            }
                        });

                        // Serves HTTP/1.1 and HTTP/2, whichever the client speaks.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        info!("invoicer stopped");
        Ok(())
    }
}

/// Resolves on the first shutdown signal the process receives: SIGTERM or
/// SIGINT on Unix, Ctrl-C elsewhere.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
