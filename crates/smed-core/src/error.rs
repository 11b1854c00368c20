// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use smed_model::ProviderError;
use smed_storage::StorageError;

/// Run-terminating failures of the session processor.
///
/// Tool failures and permission rejections are deliberately absent: they
/// land on the tool part and feed back to the model, the run continues.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already processing: {0}")]
    AlreadyProcessing(String),

    #[error("session not processing: {0}")]
    NotProcessing(String),

    #[error("run aborted")]
    Aborted,

    #[error("provider turn timed out")]
    Timeout,

    #[error("step limit exceeded after {0} provider turns")]
    StepLimit(u32),

    #[error("model output hit the length limit")]
    OutputLength,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(StorageError),
}

impl ProcessError {
    /// Stable kind tag used in `session.error` payloads and HTTP errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "not_found",
            Self::AlreadyProcessing(_) => "already_processing",
            Self::NotProcessing(_) => "not_processing",
            Self::Aborted => "aborted",
            Self::Timeout => "timeout",
            Self::StepLimit(_) => "step_limit",
            Self::OutputLength => "output_length",
            Self::Provider(_) => "provider",
            Self::Storage(StorageError::Corrupt { .. }) => "corruption",
            Self::Storage(StorageError::NotFound(_)) => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for ProcessError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
