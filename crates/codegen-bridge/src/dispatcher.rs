//! Type-keyed dispatch of received envelopes.
//!
//! Handlers run synchronously on the caller's task, one envelope at a time.
//! Typed results are published through write-once [`Slot`]s that the session
//! reads after each dispatch.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::bridge::protocol::{Envelope, MessageType, PeerError, ProjectDescription, ProtocolError};

pub type Handler = Box<dyn FnMut(&Envelope) -> Result<(), ProtocolError> + Send>;

/// Write-once cell shared between a handler and its reader.
#[derive(Debug)]
pub struct Slot<T>(Arc<OnceLock<T>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(Arc::new(OnceLock::new()))
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`; hands it back if the slot was already filled.
    pub fn set(&self, value: T) -> Result<(), T> {
        self.0.set(value)
    }

    pub fn get(&self) -> Option<&T> {
        self.0.get()
    }

    pub fn is_filled(&self) -> bool {
        self.0.get().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler registered for the type.
    Ignored,
}

pub struct MessageDispatcher {
    name: String,
    handlers: HashMap<MessageType, Handler>,
}

impl MessageDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    /// Associate a handler with a message type, replacing any previous one.
    pub fn register<F>(&mut self, message_type: MessageType, handler: F)
    where
        F: FnMut(&Envelope) -> Result<(), ProtocolError> + Send + 'static,
    {
        if self
            .handlers
            .insert(message_type.clone(), Box::new(handler))
            .is_some()
        {
            tracing::debug!(dispatcher = %self.name, %message_type, "Replaced message handler");
        }
    }

    pub fn is_registered(&self, message_type: &MessageType) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Route an envelope to its handler.
    ///
    /// Unregistered types are ignored so that peers can add message types.
    /// A payload that does not decode is a protocol error.
    pub fn handle(&mut self, envelope: &Envelope) -> Result<DispatchOutcome, ProtocolError> {
        let Some(handler) = self.handlers.get_mut(&envelope.message_type) else {
            tracing::debug!(
                dispatcher = %self.name,
                message_type = %envelope.message_type,
                "No handler registered, ignoring envelope"
            );
            return Ok(DispatchOutcome::Ignored);
        };

        if envelope.message_type.has_empty_payload() {
            envelope.expect_empty()?;
        }

        handler(envelope).inspect_err(|e| {
            tracing::error!(dispatcher = %self.name, error = %e, "Handler rejected envelope");
        })?;
        Ok(DispatchOutcome::Handled)
    }

    /// Store the first `ProjectInfoResponse` in `slot`.
    ///
    /// Later responses are ignored: the description is immutable once received.
    pub fn on_project_info(&mut self, slot: Slot<ProjectDescription>) {
        self.register(MessageType::ProjectInfoResponse, move |envelope| {
            let project: ProjectDescription = envelope.payload_as()?;
            tracing::debug!(
                root = %project.root.display(),
                framework = %project.framework,
                configuration = %project.configuration,
                deps = project.deps.len(),
                "Received project description"
            );
            if slot.set(project).is_err() {
                tracing::warn!("Duplicate project description ignored");
            }
            Ok(())
        });
    }

    /// Store the first `Error` reported by the peer in `slot`.
    pub fn on_peer_error(&mut self, slot: Slot<PeerError>) {
        self.register(MessageType::Error, move |envelope| {
            let error: PeerError = envelope.payload_as()?;
            tracing::warn!(message = %error.message, "Peer reported an error");
            let _ = slot.set(error);
            Ok(())
        });
    }
}
