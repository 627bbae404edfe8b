use std::{future::Future, io, net::SocketAddr, pin::Pin, time::Duration};
use swiftwire::wire::{self, DecodeError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{self, Instant, Sleep},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    #[error("expected message type {expected:#04x}, got {actual:#04x}")]
    MessageType { expected: u8, actual: u8 },
    #[error("sent client id {sent}, server echoed {echoed}")]
    ClientId { sent: u64, echoed: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("resolve: {0}")]
    ResolutionFailure(io::Error),
    #[error("connect: {0}")]
    ConnectFailure(io::Error),
    #[error("reply length {length} out of protocol bounds")]
    MalformedFrame { length: u32 },
    #[error("{0}")]
    MalformedBody(#[from] DecodeError),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(#[from] Mismatch),
    #[error("not connected")]
    NotConnected,
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// Whether the operation ran out of time rather than failing outright.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout | Self::HandshakeTimeout)
    }
}

/// One timer, re-armed by each deadline-bound operation in turn.
#[derive(Debug)]
struct Deadline {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Deadline {
    fn new() -> Self {
        Self {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    fn arm(&mut self, timeout: Duration) {
        self.sleep.as_mut().reset(Instant::now() + timeout);
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Never resolves while disarmed.
    async fn expired(&mut self) {
        if !self.armed {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

/// Runs `operation` against the armed deadline. Exactly one of the two
/// settles the result; the other is dropped unobserved.
async fn race<T>(
    deadline: &mut Deadline,
    operation: impl Future<Output = Result<T, Error>>,
    timed_out: Error,
) -> Result<T, Error> {
    let outcome = tokio::select! {
        biased;
        result = operation => Some(result),
        () = deadline.expired() => None,
    };
    deadline.disarm();
    match outcome {
        Some(result) => result,
        None => Err(timed_out),
    }
}

/// Client side of the HELLO exchange. At most one operation may be in flight;
/// `&mut self` on every operation enforces it.
#[derive(Debug)]
pub struct HandshakeInitiator {
    stream: Option<TcpStream>,
    deadline: Deadline,
    prefix: [u8; wire::LENGTH_PREFIX_LEN],
    body: Vec<u8>,
}

impl Default for HandshakeInitiator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeInitiator {
    pub fn new() -> Self {
        Self {
            stream: None,
            deadline: Deadline::new(),
            prefix: [0; wire::LENGTH_PREFIX_LEN],
            body: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.peer_addr().ok())
    }

    /// Resolves `host` and connects to the first endpoint that accepts, all
    /// within `timeout`. On timeout the pending socket is dropped.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<(), Error> {
        self.stream = None;
        self.deadline.arm(timeout);
        let stream = race(
            &mut self.deadline,
            resolve_and_connect(host, port),
            Error::ConnectTimeout,
        )
        .await?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(%err, "failed to set TCP_NODELAY");
        }
        tracing::info!(peer = ?stream.peer_addr().ok(), "Connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Sends HELLO(`client_id`) and waits for the matching HELLO_ACK, all
    /// within `timeout`. Returns the echoed id and the status byte.
    #[tracing::instrument(skip(self))]
    pub async fn handshake(&mut self, client_id: u64, timeout: Duration) -> Result<(u64, u8), Error> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        self.deadline.arm(timeout);
        let exchange = exchange(stream, &mut self.prefix, &mut self.body, client_id);
        race(&mut self.deadline, exchange, Error::HandshakeTimeout).await?;

        let (echoed, status) = validate(&self.body, client_id)?;
        tracing::info!(client_id = echoed, status, "Handshake complete");
        Ok((echoed, status))
    }

    /// Cancels any armed deadline and shuts the socket down. Safe to call at
    /// any time, any number of times.
    pub async fn close(&mut self) {
        self.deadline.disarm();
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                tracing::debug!(%err, "socket shutdown failed");
            }
        }
    }
}

async fn resolve_and_connect(host: &str, port: u16) -> Result<TcpStream, Error> {
    let endpoints = tokio::net::lookup_host((host, port))
        .await
        .map_err(Error::ResolutionFailure)?;
    let mut last_err = None;
    for endpoint in endpoints {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                tracing::debug!(%endpoint, %err, "Endpoint failed");
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => Error::ConnectFailure(err),
        None => Error::ResolutionFailure(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host),
        )),
    })
}

/// Write request, read length, read body. Leaves the reply in `body`.
async fn exchange(
    stream: &mut TcpStream,
    prefix: &mut [u8; wire::LENGTH_PREFIX_LEN],
    body: &mut Vec<u8>,
    client_id: u64,
) -> Result<(), Error> {
    stream
        .write_all(&wire::frame(&wire::encode_hello(client_id)))
        .await?;

    stream.read_exact(&mut prefix[..]).await?;
    let length = wire::decode_u32be(*prefix);
    if length < wire::HELLO_LEN as u32 || length > wire::MAX_CLIENT_FRAME {
        return Err(Error::MalformedFrame { length });
    }
    body.resize(length as usize, 0);
    stream.read_exact(&mut body[..]).await?;
    Ok(())
}

fn validate(body: &[u8], client_id: u64) -> Result<(u64, u8), Error> {
    let (echoed, status) = wire::decode_hello_ack(body)?;
    let kind = body[0];
    if kind != wire::MSG_HELLO_ACK {
        return Err(Mismatch::MessageType {
            expected: wire::MSG_HELLO_ACK,
            actual: kind,
        }
        .into());
    }
    if echoed != client_id {
        return Err(Mismatch::ClientId {
            sent: client_id,
            echoed,
        }
        .into());
    }
    Ok((echoed, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod validate {
        use super::*;

        #[test]
        fn accepts_matching_ack() {
            let body = wire::encode_hello_ack(42, wire::STATUS_OK);
            assert_eq!(validate(&body, 42).unwrap(), (42, wire::STATUS_OK));
        }

        #[test]
        fn passes_status_through() {
            let body = wire::encode_hello_ack(42, 200);
            assert_eq!(validate(&body, 42).unwrap(), (42, 200));
        }

        #[test]
        fn rejects_wrong_type() {
            let mut body = wire::encode_hello_ack(42, wire::STATUS_OK).to_vec();
            body[0] = wire::MSG_HELLO;
            assert!(matches!(
                validate(&body, 42),
                Err(Error::ProtocolMismatch(Mismatch::MessageType {
                    expected: 0x81,
                    actual: 0x01
                }))
            ));
        }

        #[test]
        fn rejects_wrong_id() {
            let body = wire::encode_hello_ack(43, wire::STATUS_OK);
            assert!(matches!(
                validate(&body, 42),
                Err(Error::ProtocolMismatch(Mismatch::ClientId {
                    sent: 42,
                    echoed: 43
                }))
            ));
        }

        #[test]
        fn rejects_nine_byte_body() {
            let body = wire::encode_hello(42);
            assert!(matches!(
                validate(&body, 42),
                Err(Error::MalformedBody(DecodeError::MalformedBody { .. }))
            ));
        }
    }

    mod deadline {
        use super::*;

        #[tokio::test]
        async fn operation_wins_when_first() {
            let mut deadline = Deadline::new();
            deadline.arm(Duration::from_secs(5));
            let result = race(&mut deadline, async { Ok::<_, Error>(7) }, Error::HandshakeTimeout).await;
            assert_eq!(result.unwrap(), 7);
            assert!(!deadline.armed);
        }

        #[tokio::test]
        async fn expiry_preempts_pending_operation() {
            let mut deadline = Deadline::new();
            deadline.arm(Duration::from_millis(20));
            let started = Instant::now();
            let result: Result<(), Error> = race(
                &mut deadline,
                std::future::pending(),
                Error::HandshakeTimeout,
            )
            .await;
            assert!(matches!(result, Err(Error::HandshakeTimeout)));
            assert!(started.elapsed() >= Duration::from_millis(15));
        }

        #[tokio::test]
        async fn disarmed_deadline_never_fires() {
            let mut deadline = Deadline::new();
            let expired = time::timeout(Duration::from_millis(30), deadline.expired()).await;
            assert!(expired.is_err());
        }

        #[tokio::test]
        async fn rearm_after_expiry() {
            let mut deadline = Deadline::new();
            deadline.arm(Duration::from_millis(5));
            deadline.expired().await;
            deadline.arm(Duration::from_secs(5));
            let result = race(&mut deadline, async { Ok::<_, Error>(()) }, Error::ConnectTimeout).await;
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn handshake_requires_connection() {
        let mut initiator = HandshakeInitiator::new();
        let result = initiator.handshake(1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        initiator.close().await;
        initiator.close().await;
    }
}
