//! IPC bridge between the code-generation worker and the project host.
//!
//! This module provides the wire protocol, codec and channel used by the
//! session orchestrator.
//!
//! # Architecture
//!
//! - **protocol**: Envelope, type tags and payload types
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Loopback TCP channel with bounded connect retries

pub mod codec;
pub mod protocol;
pub mod transport;
