// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use hydra_storage::StorageError;
use hydra_types::EpochId;
use thiserror::Error;

/// Error kinds of the consensus engine. Cloneable because one failure may
/// resolve many outstanding commit promises.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HydraError {
    /// Retryable from the client's point of view: lease expired, epoch
    /// cancelled, peer stopped.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A message from a previous epoch; dropped silently by the receiver.
    #[error("invalid epoch id {actual} (current epoch is {current})")]
    InvalidEpoch { actual: EpochId, current: EpochId },

    /// Sticky: once read-only, a cell accepts no further mutations.
    #[error("read-only mode is active")]
    ReadOnly,

    /// The local changelog could not be written; the epoch restarts.
    #[error("logging failed: {0}")]
    LoggingFailed(String),

    /// A protocol check that should be impossible failed. Alerted and
    /// never silently corrected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl HydraError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn logging_failed(reason: impl Into<String>) -> Self {
        Self::LoggingFailed(reason.into())
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation(reason.into())
    }
}

impl From<StorageError> for HydraError {
    fn from(error: StorageError) -> Self {
        Self::LoggingFailed(error.to_string())
    }
}

pub type HydraResult<T> = std::result::Result<T, HydraError>;
