//! TCP listener for matrix addition sessions.
//!
//! Accepts connections and runs each one as its own task, so a slow
//! computation never holds up the accept loop. The bound socket is owned by
//! `Server` and released when `run` returns.

use crate::config::Config;
use crate::error::SessionError;
use crate::session::{self, SessionLimits};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed accept, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server instance
pub struct Server {
    listener: TcpListener,
    limits: SessionLimits,
    connection_limit: Arc<Semaphore>,
    shutdown_grace: Duration,
}

impl Server {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = create_listener(config.listen, config.backlog)?;
        let listener = TcpListener::from_std(listener)?;

        Ok(Server {
            listener,
            limits: config.session_limits(),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then drain.
    ///
    /// In-flight sessions get `shutdown_grace` to finish; whatever is still
    /// running after that is aborted.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(address = %addr, "Server listening");

        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        accept_backoff(&e).await;
                        continue;
                    }
                },
            };

            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Session task failed");
                }
            }

            debug!(peer = %peer, "New connection");
            let limits = self.limits.clone();
            sessions.spawn(
                async move {
                    let _ = stream.set_nodelay(true);
                    log_outcome(session::handle_connection(stream, limits).await);
                    drop(permit);
                }
                .instrument(info_span!("session", peer = %peer)),
            );
        }

        drop(self.listener);
        info!(in_flight = sessions.len(), "Stopped accepting, draining sessions");

        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                remaining = sessions.len(),
                grace = ?self.shutdown_grace,
                "Grace period elapsed, aborting sessions"
            );
            sessions.shutdown().await;
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn accept_backoff(e: &io::Error) {
    error!(error = %e, backoff = ?ACCEPT_BACKOFF, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn log_outcome(outcome: Result<(), SessionError>) {
    match outcome {
        Ok(()) => debug!("Session complete"),
        Err(e @ SessionError::Compute(_)) => error!(error = %e, "Session failed"),
        Err(e @ SessionError::Io(_)) => debug!(error = %e, "Connection error"),
        Err(e) => warn!(error = %e, "Session rejected"),
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
