//! One accepted connection and its protocol state machine.
//!
//! A session runs three tasks, each holding an `Arc<Session>` for as long as
//! it is alive:
//!
//! - the read loop: `AwaitingLength -> AwaitingBody -> Dispatching -> ...`,
//!   strictly one read outstanding at a time;
//! - the write loop, draining the outbound queue one buffer at a time;
//! - the idle timer, which closes the session when the deadline armed by
//!   the last I/O phase passes.
//!
//! Reading and writing proceed concurrently. The read path owns its framing
//! buffers, the write path shares only the queue (behind a mutex) with
//! whoever enqueues. Once closed, every task stops and the socket halves are
//! dropped; the session is freed with the last task.

use crate::config::ServerConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc};
use swiftwire::{session::ID, wire};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{watch, Notify},
    time::{self, Instant},
};
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame length {length} outside of 1..={max}")]
    FrameTooLarge { length: u32, max: usize },
    #[error("{queued} bytes queued for writing, limit is {max}")]
    BackpressureExceeded { queued: usize, max: usize },
    #[error("no activity within the idle timeout")]
    IdleTimeout,
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingLength,
    AwaitingBody,
    Dispatching,
}

#[derive(Debug, Default)]
struct WriteQueue {
    buffers: VecDeque<Bytes>,
    queued_bytes: usize,
}

pub struct Session {
    id: ID,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    span: tracing::Span,
    queue: Mutex<WriteQueue>,
    writable: Notify,
    /// `None` while disarmed.
    idle_deadline: watch::Sender<Option<Instant>>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Takes ownership of an accepted socket and starts serving it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(stream: TcpStream, peer: SocketAddr, config: Arc<ServerConfig>) -> Arc<Self> {
        let id = swiftwire::session::new_id();
        let span = tracing::info_span!(parent: None, "session", %id, %peer);
        if config.tcp_nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                tracing::warn!(parent: &span, %err, "failed to set TCP_NODELAY");
            }
        }

        let (idle_deadline, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            peer,
            config,
            span,
            queue: Mutex::default(),
            writable: Notify::new(),
            idle_deadline,
            closed,
        });
        session.arm_idle_timer();
        tracing::info!(parent: &session.span, "Session started");

        let (reader, writer) = stream.into_split();
        let span = session.span.clone();
        tokio::spawn(session.clone().watch_idle().instrument(span.clone()));
        tokio::spawn(session.clone().drive_reads(reader).instrument(span.clone()));
        tokio::spawn(session.clone().drive_writes(writer).instrument(span));
        session
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Bytes enqueued but not yet fully written.
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().queued_bytes
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Appends `buffer` to the outbound queue.
    ///
    /// Closes the session and fails if the unflushed total would exceed
    /// `max_write_queue_bytes`. Buffers enqueued after close are discarded.
    pub fn enqueue_write(&self, buffer: Bytes) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        let max = self.config.max_write_queue_bytes;
        let was_idle = {
            let mut queue = self.queue.lock();
            let queued = queue.queued_bytes + buffer.len();
            if queued > max {
                drop(queue);
                self.close(Error::BackpressureExceeded { queued, max });
                return Err(Error::BackpressureExceeded { queued, max });
            }
            let was_idle = queue.buffers.is_empty();
            queue.queued_bytes = queued;
            queue.buffers.push_back(buffer);
            was_idle
        };
        // A non-empty queue is already being drained.
        if was_idle {
            self.writable.notify_one();
        }
        Ok(())
    }

    /// Closes the session. Only the first call has any effect; `reason` is
    /// only logged.
    pub fn close(&self, reason: Error) {
        if self.closed.send_replace(true) {
            return;
        }
        self.cancel_idle_timer();
        let _enter = self.span.enter();
        match reason {
            Error::IO(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::info!("Peer disconnected")
            }
            Error::IO(err) => tracing::warn!(%err, "Session closed"),
            reason => tracing::info!(%reason, "Session closed"),
        }
    }

    fn arm_idle_timer(&self) {
        self.idle_deadline
            .send_replace(Some(Instant::now() + self.config.idle_timeout));
    }

    fn cancel_idle_timer(&self) {
        self.idle_deadline.send_replace(None);
    }

    async fn watch_idle(self: Arc<Self>) {
        let mut deadline = self.idle_deadline.subscribe();
        let expired = async {
            loop {
                let armed = *deadline.borrow_and_update();
                match armed {
                    Some(at) => tokio::select! {
                        () = time::sleep_until(at) => {
                            // Re-armed or cancelled while the sleep was firing.
                            if *deadline.borrow() == Some(at) {
                                return;
                            }
                        }
                        _ = deadline.changed() => {}
                    },
                    None => {
                        let _ = deadline.changed().await;
                    }
                }
            }
        };
        tokio::select! {
            () = expired => self.close(Error::IdleTimeout),
            () = self.closed() => {}
        }
    }

    async fn drive_reads(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let result = tokio::select! {
            result = self.read_frames(&mut reader) => result,
            () = self.closed() => return,
        };
        if let Err(reason) = result {
            self.close(reason);
        }
    }

    async fn read_frames(&self, reader: &mut OwnedReadHalf) -> Result<(), Error> {
        let mut prefix = [0u8; wire::LENGTH_PREFIX_LEN];
        let mut body: Vec<u8> = Vec::new();
        let mut phase = Phase::AwaitingLength;
        loop {
            phase = match phase {
                Phase::AwaitingLength => {
                    self.arm_idle_timer();
                    reader.read_exact(&mut prefix).await?;
                    let length = wire::decode_u32be(prefix);
                    if length == 0 || length as usize > self.config.max_frame {
                        return Err(Error::FrameTooLarge {
                            length,
                            max: self.config.max_frame,
                        });
                    }
                    body.resize(length as usize, 0);
                    Phase::AwaitingBody
                }
                Phase::AwaitingBody => {
                    self.arm_idle_timer();
                    reader.read_exact(&mut body).await?;
                    self.cancel_idle_timer();
                    Phase::Dispatching
                }
                Phase::Dispatching => {
                    if let Some(reply) = respond(&body) {
                        self.enqueue_write(reply)?;
                    }
                    Phase::AwaitingLength
                }
            };
        }
    }

    async fn drive_writes(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        let result = tokio::select! {
            result = self.write_queued(&mut writer) => Some(result),
            () = self.closed() => None,
        };
        if let Some(Err(reason)) = result {
            self.close(reason);
        }
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(%err, "socket shutdown failed");
        }
    }

    async fn write_queued(&self, writer: &mut OwnedWriteHalf) -> Result<(), Error> {
        loop {
            let head = self.queue.lock().buffers.front().cloned();
            let buffer = match head {
                Some(buffer) => buffer,
                None => {
                    self.writable.notified().await;
                    continue;
                }
            };
            self.arm_idle_timer();
            let result = writer.write_all(&buffer).await;
            {
                let mut queue = self.queue.lock();
                queue.queued_bytes -= buffer.len();
                queue.buffers.pop_front();
            }
            result?;
            tracing::debug!("Wrote {} bytes", buffer.len());
        }
    }
}

/// Builds the framed reply to one request body, if it warrants one.
///
/// Bodies too short to carry an id are dropped without a reply.
fn respond(body: &[u8]) -> Option<Bytes> {
    let kind = wire::message_type(body)?;
    let client_id = match wire::decode_hello(body) {
        Ok(client_id) => client_id,
        Err(err) => {
            tracing::debug!(kind, %err, "dropping frame");
            return None;
        }
    };
    let status = if kind == wire::MSG_HELLO {
        wire::STATUS_OK
    } else {
        wire::STATUS_UNRECOGNIZED
    };
    tracing::debug!(kind, client_id, status, "Received hello");
    Some(wire::frame(&wire::encode_hello_ack(client_id, status)))
}
