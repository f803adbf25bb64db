//! Error types for the InstaScale controller
//!
//! Errors are structured with fields to aid debugging in production. Every
//! variant maps onto one [`RequeueClass`], which is what the reconcile loop
//! uses to decide between settling, backing off and re-planning.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for InstaScale operations
#[derive(Debug, Error)]
pub enum Error {
    /// The `orderedinstance` label does not describe the workload's pod groups
    #[error("malformed instance preference for {workload}: {message}")]
    MalformedPreference {
        /// Namespace-qualified workload name
        workload: String,
        /// Description of what's wrong with the label
        message: String,
    },

    /// A plan would push managed capacity past `maxScaleoutAllowed`
    #[error(
        "scale-out ceiling exceeded for {workload}: plan requests {requested} new replicas, \
         projected total {projected} > ceiling {ceiling}"
    )]
    ScaleoutCeilingExceeded {
        /// Namespace-qualified workload name
        workload: String,
        /// Replicas newly requested by the rejected plan
        requested: u32,
        /// Managed replicas if the plan had been applied
        projected: u32,
        /// Configured ceiling
        ceiling: u32,
    },

    /// A MachineSet holds the name a plan needs but serves another instance
    /// type or belongs to another workload
    #[error("MachineSet {pool} cannot be used by {workload}: {message}")]
    PoolNameTaken {
        /// Namespace-qualified workload name
        workload: String,
        /// Name of the MachineSet in the way
        pool: String,
        /// Why the MachineSet does not fit
        message: String,
    },

    /// Optimistic-concurrency collision on a machine pool or workload write
    #[error("conflict applying {resource}: {message}")]
    Conflict {
        /// Resource that was modified concurrently
        resource: String,
        /// API server message
        message: String,
    },

    /// Retryable API failure (timeout, connection, 5xx)
    #[error("transient API error [{context}]: {message}")]
    Transient {
        /// Operation that failed (e.g. "list machine pools")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Non-retryable API rejection (4xx other than 404/409)
    #[error("API rejected {context} (HTTP {code}): {message}")]
    Rejected {
        /// Operation that failed
        context: String,
        /// HTTP status code returned by the API server
        code: u16,
        /// API server message
        message: String,
    },

    /// Resource not found where the caller required it to exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// No MachineSet exists that can be cloned into a new pool
    #[error("no MachineSet template available for instance type {instance_type} in {namespace}")]
    MissingTemplate {
        /// Instance type the new pool was meant to serve
        instance_type: String,
        /// Namespace searched for templates
        namespace: String,
    },

    /// Invalid controller configuration or object shape
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path, if known
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },
}

/// How the reconcile loop reacts to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueClass {
    /// Wait for the object to change; retrying cannot help
    Terminal,
    /// Retry with exponential backoff
    Transient,
    /// Retry after the fixed ceiling backoff; capacity may free up
    Ceiling,
    /// Re-plan immediately from fresh state
    Replan,
}

impl Error {
    /// Create a malformed preference error for a workload
    pub fn malformed_preference(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedPreference {
            workload: workload.into(),
            message: msg.into(),
        }
    }

    /// Create a transient error with context
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
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

    /// Classify a kube-rs error raised while performing `context`
    ///
    /// 409 becomes [`Error::Conflict`], 404 [`Error::NotFound`], other 4xx
    /// responses are permanent rejections and everything else (5xx,
    /// connection and TLS failures) is transient.
    pub fn from_kube(context: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(context, ae.message),
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: context.to_string(),
                name: ae.message,
            },
            kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429 => {
                Self::Rejected {
                    context: context.to_string(),
                    code: ae.code,
                    message: ae.message,
                }
            }
            other => Self::transient(context, other.to_string()),
        }
    }

    /// Requeue behaviour for this error
    pub fn requeue_class(&self) -> RequeueClass {
        match self {
            Error::MalformedPreference { .. } => RequeueClass::Terminal,
            Error::ScaleoutCeilingExceeded { .. } => RequeueClass::Ceiling,
            Error::PoolNameTaken { .. } => RequeueClass::Ceiling,
            Error::Conflict { .. } => RequeueClass::Replan,
            Error::Transient { .. } => RequeueClass::Transient,
            // A pool that vanished between index and apply is picked up by the next plan
            Error::NotFound { .. } => RequeueClass::Replan,
            Error::MissingTemplate { .. } => RequeueClass::Ceiling,
            Error::Rejected { .. } => RequeueClass::Terminal,
            Error::Validation { .. } => RequeueClass::Terminal,
            Error::Serialization { .. } => RequeueClass::Terminal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.requeue_class() != RequeueClass::Terminal
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Self::from_kube(UNKNOWN_CONTEXT, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Convert a timeout into a transient error naming the operation
pub fn timeout_error(context: &str, timeout: Duration) -> Error {
    Error::transient(context, format!("timed out after {}s", timeout.as_secs()))
}
