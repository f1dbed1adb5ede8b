/// Remote service collaborator. The transport lives behind `RemoteServiceClient`;
/// the core only sees a request and a tagged outcome.
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::ChangeType;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub daemon: String,
    pub action_id: Uuid,
    pub change_type: ChangeType,
    pub name: String,
    pub full_path: PathBuf,
    pub old_full_path: Option<PathBuf>,
    pub timestamp: DateTime<Local>,
    /// SHA-256 of `content`, hex encoded.
    pub checksum: Option<String>,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultSeverity {
    Information,
    Warning,
    Error,
    Critical,
}

/// Structured fault reported by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFault {
    pub message: String,
    pub error_code: i32,
    pub severity: FaultSeverity,
    pub fault_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome {
    Success(String),
    Fault(ServiceFault),
    TransportError(String),
}

/// The failing half of [`ServiceOutcome`], carried by `ServiceError` events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceFailure {
    Fault(ServiceFault),
    Transport(String),
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFailure::Fault(fault) => write!(
                f,
                "{:?} fault {} ({}): {}",
                fault.severity, fault.error_code, fault.fault_id, fault.message
            ),
            ServiceFailure::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

#[async_trait]
pub trait RemoteServiceClient: Send + Sync {
    async fn call(&self, request: ServiceRequest) -> ServiceOutcome;
}
