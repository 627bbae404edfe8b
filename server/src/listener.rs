use crate::{config::ServerConfig, session::Session};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

/// Pause after a failed accept, so a persistent failure such as EMFILE
/// does not spin the loop.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    /// A single failed accept. The listener stays usable.
    #[error("accept: {0}")]
    Accept(io::Error),
}

pub struct Listener {
    socket: TcpListener,
    config: Arc<ServerConfig>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self, Error> {
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        tracing::info!(
            %addr,
            idle_timeout = ?config.idle_timeout,
            max_frame = config.max_frame,
            max_write_queue_bytes = config.max_write_queue_bytes,
            "Listener bound"
        );
        Ok(Self {
            socket,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts one connection and starts its session.
    ///
    /// The session runs on its own; the returned handle may be dropped.
    pub async fn accept(&self) -> Result<Arc<Session>, Error> {
        let (stream, peer) = self.socket.accept().await.map_err(Error::Accept)?;
        Ok(Session::start(stream, peer, self.config.clone()))
    }

    /// Accepts connections until the future is dropped.
    #[tracing::instrument(skip(self), fields(addr = ?self.local_addr().ok()))]
    pub async fn run(&self) {
        loop {
            match self.accept().await {
                Ok(session) => tracing::debug!(id = %session.id(), peer = %session.peer(), "Accepted"),
                Err(err) => accept_failed(err).await,
            }
        }
    }
}

async fn accept_failed(err: Error) {
    tracing::warn!(%err, backoff = ?ACCEPT_BACKOFF, "Accept failed, continuing");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}
