//! Listener, per-connection dispatch, and graceful shutdown.
//!
//! # One task per connection
//!
//! Each accepted socket gets its own task. The task reads the first request
//! head (see [`head`](crate::head)) and commits the whole connection to one
//! of two flows:
//!
//! - **upgrade** → the raw [`tunnel`](crate::tunnel) to the primary backend;
//! - **anything else** → hyper, fed the sniffed bytes first, with every
//!   request going through [`forward`](crate::forward).
//!
//! # Graceful shutdown and Kubernetes
//!
//! On **SIGTERM** or Ctrl-C the server:
//! 1. Stops `listener.accept()` immediately.
//! 2. Lets in-flight connections finish for up to the configured grace
//!    period (`PROXY_SHUTDOWN_GRACE_SECS`, default 30 s).
//! 3. Aborts whatever is still running (long-lived tunnels, mostly) and
//!    returns from [`Server::serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::forward;
use crate::head::{self, Intake};
use crate::rewind::Rewind;
use crate::route::Routes;
use crate::tunnel;

/// The proxy server.
pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Binds `0.0.0.0:<listen port>` and serves until SIGTERM or Ctrl-C.
    ///
    /// A bind failure (port in use, permission denied) is returned as
    /// [`Error::Bind`]; it is not retried.
    pub async fn serve(self) -> Result<(), Error> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serves on an already-bound listener until `shutdown` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        let routes = Arc::new(self.config.routes());

        info!(
            port = addr.port(),
            gateway = self.config.primary_port,
            gog = self.config.secondary_port,
            "listening on {addr} → gateway:{} | gog:{}",
            self.config.primary_port,
            self.config.secondary_port,
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Shutdown wins over queued connections.
                biased;

                () = &mut shutdown => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(handle(stream, peer, Arc::clone(&routes)));
                }

                // Reap finished tasks so the set does not grow without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drain(&mut tasks, self.config.shutdown_grace).await;
        info!("splitgate stopped");
        Ok(())
    }
}

async fn drain(tasks: &mut JoinSet<()>, grace: Duration) {
    let all_done = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, all_done).await.is_err() {
        warn!(aborted = tasks.len(), "grace period elapsed, aborting connections");
        tasks.shutdown().await;
    }
}

// ── Connection dispatch ───────────────────────────────────────────────────────

/// Classifies one connection and runs it to completion.
async fn handle(mut stream: TcpStream, peer: SocketAddr, routes: Arc<Routes>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {e}");
    }

    let intake = match head::read(&mut stream).await {
        Ok(intake) => intake,
        Err(e) => {
            debug!(%peer, "read error before first request: {e}");
            return;
        }
    };

    match intake {
        Intake::Closed => {}
        Intake::Upgrade { head, buffered } => {
            let backend = routes.addr(routes.upgrade());
            debug!(%peer, path = %head.path, %backend, "tunnelling upgrade");
            match tunnel::open(stream, &head, &buffered, backend).await {
                Ok(spliced) => {
                    debug!(%peer, up = spliced.upstream, down = spliced.downstream, "tunnel closed");
                }
                Err(e) => debug!(%peer, "tunnel failed: {e}"),
            }
        }
        Intake::Http { buffered } => serve_http(Rewind::new(buffered, stream), peer, routes).await,
    }
}

/// Hands the connection to hyper. HTTP/1.1 or HTTP/2, whichever the caller
/// speaks.
async fn serve_http(io: Rewind<TcpStream>, peer: SocketAddr, routes: Arc<Routes>) {
    // `service_fn` is called once per request on the connection.
    let svc = service_fn(move |req| {
        let routes = Arc::clone(&routes);
        async move { forward::forward(&routes, req, peer).await }
    });

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);

    if let Err(e) = builder.serve_connection_with_upgrades(TokioIo::new(io), svc).await {
        debug!(%peer, "connection error: {e}");
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM (Unix) or Ctrl-C.
///
/// A handler that cannot be installed is logged and treated as a signal
/// that never arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
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
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
