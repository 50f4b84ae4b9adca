//! Loopback transport channel between the worker and the project host.
//!
//! One bidirectional TCP connection to `127.0.0.1:<port>`, framed with
//! [`JsonCodec`]. Calls are strictly sequential: at most one outstanding
//! receive and no concurrent senders.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::{CodecError, JsonCodec};
use super::protocol::{Envelope, ProtocolError};
use crate::logging::Logger;

/// Connection establishment policy.
///
/// The host may still be starting when the worker launches, so connecting is
/// retried with exponential backoff for a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: std::env::var("CODEGEN_CONNECT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(5),
            backoff_base: Duration::from_millis(
                std::env::var("CODEGEN_CONNECT_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(100),
            ),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl ConnectConfig {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        (self.backoff_base * (1 << exp)).min(self.backoff_max)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("could not connect to 127.0.0.1:{port} after {attempts} attempts: {source}")]
    Connect {
        port: u16,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("channel i/o error: {0}")]
    Io(#[source] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel closed")]
    Closed,
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => Self::Io(e),
            CodecError::Frame(msg) => Self::Protocol(ProtocolError::Frame(msg)),
            CodecError::Json(e) => Self::Protocol(ProtocolError::Envelope(e)),
        }
    }
}

/// A framed, bidirectional envelope channel.
pub struct Channel<S = TcpStream> {
    framed: Option<Framed<S, JsonCodec<Envelope>>>,
    peer: String,
    logger: Logger,
}

impl Channel<TcpStream> {
    /// Connect to the host on the loopback interface.
    pub async fn connect(
        port: u16,
        config: &ConnectConfig,
        logger: Logger,
    ) -> Result<Self, ChannelError> {
        let stream = logger.scope(connect_with_retry(port, config)).await?;
        Ok(Self::from_stream(stream, format!("127.0.0.1:{port}"), logger))
    }
}

async fn connect_with_retry(port: u16, config: &ConnectConfig) -> Result<TcpStream, ChannelError> {
    let attempts = config.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        tracing::debug!(port, attempt, "Connecting to host");
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
                }
                tracing::info!(port, attempt, "Connected to host");
                return Ok(stream);
            }
            Err(e) if attempt >= attempts => {
                tracing::error!(port, attempts = attempt, error = %e, "Giving up connecting to host");
                return Err(ChannelError::Connect {
                    port,
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let backoff = config.backoff(attempt);
                tracing::warn!(
                    port,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Host not reachable, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: S, peer: impl Into<String>, logger: Logger) -> Self {
        Self {
            framed: Some(Framed::new(stream, JsonCodec::new())),
            peer: peer.into(),
            logger,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    /// Send one envelope and flush it to the peer.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        let logger = self.logger.clone();
        logger.scope(self.send_inner(envelope)).await
    }

    async fn send_inner(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        let framed = self.framed.as_mut().ok_or(ChannelError::Closed)?;
        let message_type = envelope.message_type.clone();
        framed.send(envelope).await.map_err(|e| {
            tracing::warn!(peer = %self.peer, %message_type, error = %e, "Send failed");
            ChannelError::from(e)
        })?;
        tracing::trace!(peer = %self.peer, %message_type, "Sent envelope");
        Ok(())
    }

    /// Wait for the next envelope. No timeout is applied here.
    pub async fn receive(&mut self) -> Result<Envelope, ChannelError> {
        let logger = self.logger.clone();
        logger.scope(self.receive_inner()).await
    }

    async fn receive_inner(&mut self) -> Result<Envelope, ChannelError> {
        let framed = self.framed.as_mut().ok_or(ChannelError::Closed)?;
        match framed.next().await {
            Some(Ok(envelope)) => {
                tracing::trace!(peer = %self.peer, message_type = %envelope.message_type, "Received envelope");
                Ok(envelope)
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %self.peer, error = %e, "Receive failed");
                Err(e.into())
            }
            None => {
                tracing::debug!(peer = %self.peer, "Peer closed the connection");
                Err(ChannelError::Closed)
            }
        }
    }

    /// Flush, shut down and release the connection. Idempotent.
    pub async fn close(&mut self) {
        let logger = self.logger.clone();
        logger.scope(self.close_inner()).await
    }

    async fn close_inner(&mut self) {
        let Some(mut framed) = self.framed.take() else {
            return;
        };
        if let Err(e) = SinkExt::<Envelope>::close(&mut framed).await {
            tracing::debug!(peer = %self.peer, error = %e, "Error while shutting down channel");
        }
        tracing::debug!(peer = %self.peer, "Channel closed");
    }
}

impl<S> Drop for Channel<S> {
    fn drop(&mut self) {
        if self.framed.is_some() {
            // Dropping the stream still releases the socket; the peer sees an
            // abrupt close, which it must treat as failure.
            self.logger.in_scope(|| {
                tracing::debug!(peer = %self.peer, "Channel dropped without close");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MessageType;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn pair() -> (Channel<DuplexStream>, Framed<DuplexStream, JsonCodec<Envelope>>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let channel = Channel::from_stream(ours, "duplex", Logger::none());
        (channel, Framed::new(theirs, JsonCodec::new()))
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let config = ConnectConfig::default()
            .with_backoff_base(Duration::from_millis(100))
            .with_backoff_max(Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(ConnectConfig::default().with_max_attempts(0).attempts(), 1);
    }

    #[tokio::test]
    async fn send_and_receive_envelopes() {
        let (mut channel, mut peer) = pair();

        channel.send(Envelope::project_info_request()).await.unwrap();
        let request = peer.next().await.unwrap().unwrap();
        assert_eq!(request.message_type, MessageType::ProjectInfoRequest);

        peer.send(Envelope::completed()).await.unwrap();
        let reply = channel.receive().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Completed);
    }

    #[tokio::test]
    async fn receive_after_peer_close_reports_closed() {
        let (mut channel, peer) = pair();
        drop(peer);
        assert!(matches!(channel.receive().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn garbage_frame_is_a_protocol_error() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let mut channel = Channel::from_stream(ours, "duplex", Logger::none());

        let body = b"definitely not json";
        theirs.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        theirs.write_all(body).await.unwrap();

        assert!(matches!(
            channel.receive().await,
            Err(ChannelError::Protocol(ProtocolError::Envelope(_)))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut channel, mut peer) = pair();

        channel.close().await;
        assert!(channel.is_closed());
        channel.close().await;
        assert!(channel.is_closed());

        assert!(peer.next().await.is_none());
        assert!(matches!(
            channel.send(Envelope::completed()).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(channel.receive().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        // Reserve a port, then free it so nothing is listening.
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (logger, mut capture) = Logger::capture();
        let config = ConnectConfig::default()
            .with_max_attempts(3)
            .with_backoff_base(Duration::from_millis(1));
        let err = Channel::connect(port, &config, logger).await.err().unwrap();

        match err {
            ChannelError::Connect { port: p, attempts, .. } => {
                assert_eq!(p, port);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        let retries = capture
            .drain()
            .into_iter()
            .filter(|line| line.contains("Host not reachable, retrying"))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn connect_reaches_a_listening_host() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut peer = Framed::new(stream, JsonCodec::<Envelope>::new());
            peer.next().await.unwrap().unwrap()
        });

        let mut channel = Channel::connect(port, &ConnectConfig::default(), Logger::none())
            .await
            .unwrap();
        assert_eq!(channel.peer(), format!("127.0.0.1:{port}"));
        channel.send(Envelope::completed()).await.unwrap();
        channel.close().await;

        let received = accept.await.unwrap();
        assert_eq!(received.message_type, MessageType::Completed);
    }
}
