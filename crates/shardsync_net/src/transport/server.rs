//! Server role: accept loop on a listening socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::AbortHandle;

use super::connection::{self, ConnectionState};
use super::{EngineShared, TransportEngine};
use crate::error::TransportResult;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to a listening socket owned by a [`TransportEngine`].
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    task: AbortHandle,
}

impl Server {
    /// Returns the address the listener is bound to.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Open connections stay open.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl<S: ConnectionState> TransportEngine<S> {
    /// Binds `addr` and accepts connections until shutdown.
    ///
    /// Pass port 0 to let the OS pick one; see [`Server::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`](crate::TransportError::Io) if the bind
    /// fails, or [`TransportError::ShutDown`](crate::TransportError::ShutDown).
    pub fn listen(&mut self, addr: SocketAddr) -> TransportResult<Server> {
        let runtime = self.runtime()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;

        let task = runtime.spawn(accept_loop(Arc::clone(&self.shared), listener));
        let server = Server {
            local_addr,
            task: task.abort_handle(),
        };
        self.listeners.push(task);

        tracing::info!(addr = %local_addr, "listening");
        Ok(server)
    }
}

async fn accept_loop<S: ConnectionState>(shared: Arc<EngineShared<S>>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                // Rejected sockets are dropped inside `open`.
                let _ = connection::open(&shared, stream, peer);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
