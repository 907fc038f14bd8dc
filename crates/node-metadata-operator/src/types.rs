use crate::store::{MachineSetId, StoreError, TargetRef};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to fetch {target}: {source}")]
    Fetch {
        target: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to list machines for MachineSet {machine_set}: {source}")]
    List {
        machine_set: MachineSetId,
        #[source]
        source: StoreError,
    },

    #[error("Concurrent modification of {target}")]
    UpdateConflict { target: TargetRef },

    #[error("Failed to update labels on {target}: {source}")]
    Update {
        target: TargetRef,
        #[source]
        source: StoreError,
    },

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,
}

/// Coarse classification of failures, used for logging and requeue decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FetchFailure,
    ListFailure,
    UpdateConflict,
    UpdateFailure,
    Cancelled,
    Internal,
}

impl Error {
    /// Build the update error matching the store failure.
    #[must_use]
    pub fn from_update(target: TargetRef, source: StoreError) -> Self {
        match source {
            StoreError::Conflict { .. } => Error::UpdateConflict { target },
            source => Error::Update { target, source },
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fetch { .. } => ErrorKind::FetchFailure,
            Error::List { .. } => ErrorKind::ListFailure,
            Error::UpdateConflict { .. } => ErrorKind::UpdateConflict,
            Error::Update { .. } => ErrorKind::UpdateFailure,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::KubeError(_) | Error::MissingObjectKey => ErrorKind::Internal,
        }
    }

    /// Whether a fresh pass may succeed where this one failed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::FetchFailure
                | ErrorKind::ListFailure
                | ErrorKind::UpdateConflict
                | ErrorKind::UpdateFailure
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
