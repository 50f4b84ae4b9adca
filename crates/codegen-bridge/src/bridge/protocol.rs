//! Wire protocol types for worker-host communication.
//!
//! Every frame carries one [`Envelope`]: a type tag plus an opaque payload whose
//! shape is determined by the tag.
//! - **ProjectInfoRequest** (worker → host): empty payload
//! - **ProjectInfoResponse** (host → worker): [`ProjectDescription`]
//! - **FileSystemChange** (worker → host): [`FileSystemChange`]
//! - **Completed** (worker → host): empty payload
//! - **Error** (either direction): [`PeerError`]

use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope type tag.
///
/// Tags this worker does not know decode to [`MessageType::Unknown`] so that a
/// newer host can extend the protocol without breaking older workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    ProjectInfoRequest,
    ProjectInfoResponse,
    FileSystemChange,
    Completed,
    Error,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ProjectInfoRequest => "ProjectInfoRequest",
            Self::ProjectInfoResponse => "ProjectInfoResponse",
            Self::FileSystemChange => "FileSystemChange",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Unknown(tag) => tag,
        }
    }

    /// Types whose payload must be empty.
    pub fn has_empty_payload(&self) -> bool {
        matches!(self, Self::ProjectInfoRequest | Self::Completed)
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ProjectInfoRequest" => Self::ProjectInfoRequest,
            "ProjectInfoResponse" => Self::ProjectInfoResponse,
            "FileSystemChange" => Self::FileSystemChange,
            "Completed" => Self::Completed,
            "Error" => Self::Error,
            _ => Self::Unknown(tag),
        }
    }
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised when bytes or payloads do not form a well-formed envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("payload of {message_type} does not match its type: {source}")]
    Payload {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("{message_type} must carry an empty payload")]
    UnexpectedPayload { message_type: MessageType },

    #[error("failed to encode {message_type} payload: {source}")]
    Encode {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    pub fn project_info_request() -> Self {
        Self::new(MessageType::ProjectInfoRequest, serde_json::Value::Null)
    }

    pub fn project_info_response(project: &ProjectDescription) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::ProjectInfoResponse, project)
    }

    pub fn file_system_change(change: &FileSystemChange) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::FileSystemChange, change)
    }

    pub fn completed() -> Self {
        Self::new(MessageType::Completed, serde_json::Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "message": message.into() });
        Self::new(MessageType::Error, payload)
    }

    fn with_payload<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload).map_err(|source| ProtocolError::Encode {
            message_type: message_type.clone(),
            source,
        })?;
        Ok(Self::new(message_type, payload))
    }

    /// Size of the JSON body this envelope occupies in a frame.
    pub fn encoded_len(&self) -> Result<usize, ProtocolError> {
        serde_json::to_vec(self)
            .map(|json| json.len())
            .map_err(|source| ProtocolError::Encode {
                message_type: self.message_type.clone(),
                source,
            })
    }

    /// Decode the payload into the shape implied by the type tag.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.message_type, self.payload.clone())
    }

    /// Reject anything but `null` or `{}` for payload-less types.
    pub fn expect_empty(&self) -> Result<(), ProtocolError> {
        let empty = match &self.payload {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedPayload {
                message_type: self.message_type.clone(),
            })
        }
    }
}

pub fn decode_payload<T: DeserializeOwned>(
    message_type: &MessageType,
    payload: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::Payload {
        message_type: message_type.clone(),
        source,
    })
}

/// Authoritative project facts owned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescription {
    pub root: PathBuf,
    /// Target framework moniker, e.g. `net6.0`.
    pub framework: String,
    /// Build configuration name, e.g. `Debug`.
    pub configuration: String,
    #[serde(default)]
    pub deps: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_directory: Option<PathBuf>,
}

impl ProjectDescription {
    pub fn new(
        root: impl Into<PathBuf>,
        framework: impl Into<String>,
        configuration: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            framework: framework.into(),
            configuration: configuration.into(),
            deps: Vec::new(),
            project_name: None,
            target_directory: None,
        }
    }

    pub fn with_dep(mut self, dep: Dependency) -> Self {
        self.deps.push(dep);
        self
    }

    /// Reason this description cannot drive generation, if any.
    pub fn unusable_reason(&self) -> Option<&'static str> {
        if self.root.as_os_str().is_empty() {
            Some("project root is empty")
        } else if self.framework.trim().is_empty() {
            Some("target framework is empty")
        } else {
            None
        }
    }
}

/// A resolved dependency or reference of the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyKind {
    #[default]
    Package,
    Project,
    Reference,
}

/// Kind of file-system mutation requested by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
    AddDirectory,
    RemoveDirectory,
}

impl ChangeKind {
    pub fn requires_contents(&self) -> bool {
        matches!(self, Self::Add | Self::Update)
    }
}

/// One requested mutation. Sent as an independent envelope, in producer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    /// Human-readable description of what produced the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FileSystemChange {
    pub fn add(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Add,
            path: path.into(),
            contents: Some(contents.into()),
            description: None,
        }
    }

    pub fn update(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Update,
            path: path.into(),
            contents: Some(contents.into()),
            description: None,
        }
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Remove,
            path: path.into(),
            contents: None,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check that contents are present exactly when the kind needs them.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("change has an empty path".to_string());
        }
        match (self.kind.requires_contents(), self.contents.is_some()) {
            (true, false) => Err(format!(
                "{:?} change for {} has no contents",
                self.kind,
                self.path.display()
            )),
            (false, true) => Err(format!(
                "{:?} change for {} must not carry contents",
                self.kind,
                self.path.display()
            )),
            _ => Ok(()),
        }
    }
}

/// Payload of an `Error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerError {
    pub message: String,
}
