//! Session orchestrator - drives one worker conversation with the host.
//!
//! Flow:
//! 1. Connect to the host (bounded retries)
//! 2. Send ProjectInfoRequest, dispatch replies until the project description arrives
//! 3. Run the generator
//! 4. Forward each change as a FileSystemChange envelope, in order
//! 5. Send Completed
//! 6. Close the channel (on every exit path, including aborts)
//!
//! The host tells success from failure by whether `Completed` arrived before the
//! connection closed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

use crate::bridge::codec::MAX_FRAME_LENGTH;
use crate::bridge::protocol::{
    Envelope, FileSystemChange, PeerError, ProjectDescription, ProtocolError,
};
use crate::bridge::transport::{Channel, ChannelError, ConnectConfig};
use crate::dispatcher::{MessageDispatcher, Slot};
use crate::generator::{GenerationError, Generator};
use crate::logging::Logger;

/// Process exit codes reported for each session outcome.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// Generation failure without an explicit code.
    pub const GENERATION_DEFAULT: i32 = crate::generator::DEFAULT_GENERATION_EXIT_CODE;
    /// Invalid command line (used by the worker binary).
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 3;
    pub const PROTOCOL: i32 = 4;
    pub const PROJECT_INFORMATION: i32 = 5;
    pub const TRANSPORT: i32 = 6;
}

/// Identifier used to correlate log lines of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    AwaitingProjectInfo,
    Generating,
    SendingChanges,
    Completing,
    Closed,
    /// Terminal state after any unrecoverable error.
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    /// Configuration name handed to the generator. Falls back to the
    /// configuration reported by the host.
    pub configuration: Option<String>,
    pub connect: ConnectConfig,
    /// Upper bound on waiting for the project description. `None` waits forever.
    pub project_info_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(port: u16) -> Self {
        let timeout_secs = std::env::var("CODEGEN_PROJECT_INFO_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            port,
            configuration: None,
            connect: ConnectConfig::default(),
            project_info_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    pub fn with_connect(mut self, connect: ConnectConfig) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_project_info_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.project_info_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to host: {0}")]
    Connection(#[source] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("project information unavailable: {0}")]
    ProjectInformation(String),

    #[error("lost connection to host: {0}")]
    Transport(#[source] ChannelError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<ChannelError> for SessionError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Connect { .. } => Self::Connection(e),
            ChannelError::Protocol(e) => Self::Protocol(e),
            ChannelError::Io(_) | ChannelError::Closed => Self::Transport(e),
        }
    }
}

impl SessionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Connection(_) => exit_code::CONNECTION,
            Self::Protocol(_) => exit_code::PROTOCOL,
            Self::ProjectInformation(_) => exit_code::PROJECT_INFORMATION,
            Self::Transport(_) => exit_code::TRANSPORT,
            Self::Generation(e) => e.exit_code(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub project: ProjectDescription,
    pub changes_sent: usize,
}

pub struct Session {
    id: SessionId,
    config: SessionConfig,
    logger: Logger,
    state: SessionState,
    history: Vec<SessionState>,
}

impl Session {
    pub fn new(config: SessionConfig, logger: Logger) -> Self {
        Self {
            id: SessionId::new(),
            config,
            logger,
            state: SessionState::Connecting,
            history: vec![SessionState::Connecting],
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Connect to the host and run the whole conversation.
    pub async fn run<G>(&mut self, generator: &G) -> Result<SessionReport, SessionError>
    where
        G: Generator + ?Sized,
    {
        let logger = self.logger.clone();
        logger
            .scope(async {
                let span = tracing::info_span!("session", id = %self.id, port = self.config.port);
                self.connect_and_converse(generator).instrument(span).await
            })
            .await
    }

    /// Run the conversation over an already-established channel.
    pub async fn run_on_channel<S, G>(
        &mut self,
        channel: Channel<S>,
        generator: &G,
    ) -> Result<SessionReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        G: Generator + ?Sized,
    {
        let logger = self.logger.clone();
        logger
            .scope(async {
                let span = tracing::info_span!("session", id = %self.id, peer = %channel.peer());
                self.converse_and_close(channel, generator)
                    .instrument(span)
                    .await
            })
            .await
    }

    async fn connect_and_converse<G>(&mut self, generator: &G) -> Result<SessionReport, SessionError>
    where
        G: Generator + ?Sized,
    {
        if self.state.is_terminal() {
            return Err(SessionError::Transport(ChannelError::Closed));
        }
        self.transition(SessionState::Connecting);
        let channel = match Channel::connect(
            self.config.port,
            &self.config.connect,
            self.logger.clone(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let err = SessionError::Connection(e);
                self.abort(&err);
                return Err(err);
            }
        };
        self.converse_and_close(channel, generator).await
    }

    async fn converse_and_close<S, G>(
        &mut self,
        mut channel: Channel<S>,
        generator: &G,
    ) -> Result<SessionReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        G: Generator + ?Sized,
    {
        if self.state.is_terminal() {
            channel.close().await;
            return Err(SessionError::Transport(ChannelError::Closed));
        }
        let result = self.converse(&mut channel, generator).await;
        channel.close().await;

        match result {
            Ok(report) => {
                self.transition(SessionState::Closed);
                tracing::info!(changes_sent = report.changes_sent, "Session completed");
                Ok(report)
            }
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    async fn converse<S, G>(
        &mut self,
        channel: &mut Channel<S>,
        generator: &G,
    ) -> Result<SessionReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        G: Generator + ?Sized,
    {
        self.transition(SessionState::AwaitingProjectInfo);
        let project = self.await_project_info(channel).await?;

        self.transition(SessionState::Generating);
        let configuration = self
            .config
            .configuration
            .clone()
            .unwrap_or_else(|| project.configuration.clone());
        tracing::info!(%configuration, root = %project.root.display(), "Running generator");
        let changes = generator.generate(&project, &configuration).await?;
        let envelopes = encode_changes(&changes)?;

        self.transition(SessionState::SendingChanges);
        let total = envelopes.len();
        for (sent, (change, envelope)) in changes.iter().zip(envelopes).enumerate() {
            if let Err(e) = channel.send(envelope).await {
                tracing::error!(sent, total, error = %e, "Failed to forward file system change");
                return Err(e.into());
            }
            tracing::debug!(kind = ?change.kind, path = %change.path.display(), "Forwarded change");
        }

        self.transition(SessionState::Completing);
        channel.send(Envelope::completed()).await?;

        Ok(SessionReport {
            session_id: self.id,
            project,
            changes_sent: total,
        })
    }

    async fn await_project_info<S>(
        &mut self,
        channel: &mut Channel<S>,
    ) -> Result<ProjectDescription, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        channel.send(Envelope::project_info_request()).await?;

        let project_slot = Slot::new();
        let error_slot = Slot::new();
        let mut dispatcher = MessageDispatcher::new("codegen-worker");
        dispatcher.on_project_info(project_slot.clone());
        dispatcher.on_peer_error(error_slot.clone());

        let wait = receive_project_info(channel, &mut dispatcher, &project_slot, &error_slot);

        let project = match self.config.project_info_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                SessionError::ProjectInformation(format!(
                    "no project information from host within {}ms",
                    timeout.as_millis()
                ))
            })??,
            None => wait.await?,
        };

        if let Some(reason) = project.unusable_reason() {
            return Err(SessionError::ProjectInformation(reason.to_string()));
        }
        Ok(project)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Session state transition");
        }
        self.state = next;
        if self.history.last() != Some(&next) {
            self.history.push(next);
        }
    }

    fn abort(&mut self, err: &SessionError) {
        tracing::error!(from = ?self.state, exit_code = err.exit_code(), error = %err, "Session aborted");
        self.transition(SessionState::Aborted);
    }
}

/// Validate and encode every change before anything is sent.
fn encode_changes(changes: &[FileSystemChange]) -> Result<Vec<Envelope>, SessionError> {
    let mut envelopes = Vec::with_capacity(changes.len());
    for (index, change) in changes.iter().enumerate() {
        change.validate().map_err(|reason| {
            GenerationError::new(format!("invalid change #{index}: {reason}"))
        })?;
        let envelope = Envelope::file_system_change(change)?;
        let size = envelope.encoded_len()?;
        if size > MAX_FRAME_LENGTH {
            return Err(GenerationError::new(format!(
                "change #{index} ({}) encodes to {size} bytes, over the {MAX_FRAME_LENGTH} byte frame limit",
                change.path.display()
            ))
            .into());
        }
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

/// Receive and dispatch envelopes until the host answers the project info request.
async fn receive_project_info<S>(
    channel: &mut Channel<S>,
    dispatcher: &mut MessageDispatcher,
    project_slot: &Slot<ProjectDescription>,
    error_slot: &Slot<PeerError>,
) -> Result<ProjectDescription, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let envelope = match channel.receive().await {
            Ok(envelope) => envelope,
            Err(ChannelError::Closed) => {
                return Err(SessionError::ProjectInformation(
                    "host closed the connection before sending project information".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        dispatcher.handle(&envelope)?;

        if let Some(project) = project_slot.get() {
            return Ok(project.clone());
        }
        if let Some(error) = error_slot.get() {
            return Err(SessionError::ProjectInformation(format!(
                "host reported an error: {}",
                error.message
            )));
        }
    }
}
