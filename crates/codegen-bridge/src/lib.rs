//! codegen-bridge: worker side of the code-generation host protocol.

pub mod bridge;
pub mod dispatcher;
pub mod generator;
pub mod logging;
pub mod session;

pub use bridge::protocol::{
    ChangeKind, Dependency, DependencyKind, Envelope, FileSystemChange, MessageType, PeerError,
    ProjectDescription, ProtocolError,
};
pub use bridge::transport::{Channel, ChannelError, ConnectConfig};
pub use dispatcher::{DispatchOutcome, MessageDispatcher, Slot};
pub use generator::{FnGenerator, GenerationError, Generator};
pub use logging::{LogCapture, Logger};
pub use session::{
    Session, SessionConfig, SessionError, SessionId, SessionReport, SessionState, exit_code,
};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
