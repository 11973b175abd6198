//! Error types for the provisioning core
//!
//! Every driver, enforcer and builder operation returns one of these variants
//! directly to its caller. Variants carry enough context (kind, namespace,
//! name, violated dimension) for callers to render actionable messages.

use std::fmt;

use thiserror::Error;

/// Why a lifecycle operation conflicts with the current VM state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    /// A VM with the same namespace/id already exists
    AlreadyExists,
    /// Start requested on a running VM
    AlreadyRunning,
    /// Stop requested on a stopped VM
    AlreadyStopped,
    /// Restart requested on a VM that is not running
    NotRunning,
    /// IP requested for a VM without an assigned address
    NoIpAssigned,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "already exists"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::AlreadyStopped => write!(f, "already stopped"),
            Self::NotRunning => write!(f, "not running"),
            Self::NoIpAssigned => write!(f, "no IP address assigned"),
        }
    }
}

/// Quota dimension that a request exceeded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceDimension {
    /// CPU cores
    Cpu,
    /// Memory
    Memory,
    /// Disk / persistent storage
    Storage,
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Memory => write!(f, "Memory"),
            Self::Storage => write!(f, "Storage"),
        }
    }
}

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown namespace/id pair
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind that was looked up
        kind: String,
        /// Namespace of the lookup
        namespace: String,
        /// Name or id of the lookup
        name: String,
    },

    /// Duplicate create or invalid state transition
    #[error("conflict for {target}: {reason}")]
    Conflict {
        /// Why the operation conflicts
        reason: ConflictReason,
        /// `namespace/id` of the VM involved
        target: String,
    },

    /// Quota violation
    #[error("resource exceeded: {dimension} request {requested} exceeds quota {limit}")]
    ResourceExceeded {
        /// The violated dimension
        dimension: ResourceDimension,
        /// Requested amount, human readable (e.g. "20Gi")
        requested: String,
        /// Ceiling, human readable (e.g. "16Gi")
        limit: String,
    },

    /// Control plane unreachable or timed out
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the connectivity failure
        message: String,
    },

    /// Malformed template or unresolvable object
    #[error("materialization error for {kind}/{name}: {message}")]
    Materialization {
        /// Kind of the failing object
        kind: String,
        /// Name of the failing object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid caller input (e.g. an unparseable quantity)
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being processed (if known)
        kind: Option<String>,
    },

    /// Uncategorised Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create a not-found error for a resource
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the VM at `namespace/id`
    pub fn conflict(reason: ConflictReason, namespace: &str, id: &str) -> Self {
        Self::Conflict {
            reason,
            target: format!("{}/{}", namespace, id),
        }
    }

    /// Create a quota violation for one dimension
    pub fn resource_exceeded(
        dimension: ResourceDimension,
        requested: impl Into<String>,
        limit: impl Into<String>,
    ) -> Self {
        Self::ResourceExceeded {
            dimension,
            requested: requested.into(),
            limit: limit.into(),
        }
    }

    /// Create a backend-unavailable error
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: msg.into(),
        }
    }

    /// Create a materialization error naming the failing object
    pub fn materialization(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Materialization {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Conflict reason, if this is a conflict
    pub fn conflict_reason(&self) -> Option<ConflictReason> {
        match self {
            Self::Conflict { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Violated quota dimension, if this is a quota error
    pub fn exceeded_dimension(&self) -> Option<ResourceDimension> {
        match self {
            Self::ResourceExceeded { dimension, .. } => Some(*dimension),
            _ => None,
        }
    }

    /// Returns true for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error is retryable
    ///
    /// Only connectivity problems and transient API failures are retryable;
    /// everything else needs the caller to change its request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BackendUnavailable { .. } => true,
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::NotFound { .. }
            | Error::Conflict { .. }
            | Error::ResourceExceeded { .. }
            | Error::Materialization { .. }
            | Error::Validation(_)
            | Error::Serialization { .. } => false,
        }
    }
}
