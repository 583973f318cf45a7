//! Typed registrar failures
//!
//! The reconcile engine pattern-matches on these to pick the status
//! condition and requeue policy; transport-class failures stay wrapped in
//! [`RegisterError::Other`].

use thiserror::Error;

use crate::error::Error;

/// Failure modes of registrar convergence
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The cluster's topology mode does not take part in convergence
    #[error("mode {mode} not yet supported")]
    ModeNotSupported { mode: String },

    /// The transit gateway exists but cannot accept attachments yet
    #[error("transit gateway not available")]
    TransitGatewayNotAvailable,

    /// The cluster VPC has not been provisioned yet
    #[error("VPC not ready")]
    VpcNotReady,

    /// A required id annotation is missing in UserManaged mode
    #[error("{resource} ID not provided")]
    IdNotProvided { resource: String },

    /// The cluster CIDR is already claimed by another cluster on the prefix list
    #[error("conflicting CIDR already exists on prefix list")]
    ConflictingCidr,

    /// Any transport or object-store failure
    #[error(transparent)]
    Other(#[from] Error),
}

impl From<RegisterError> for Error {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::Other(err) => err,
            other => Error::validation(other.to_string()),
        }
    }
}
