// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod ids;
mod mock;
mod provider;
mod types;
mod wire;

pub use mock::{EchoProvider, ScriptedProvider};
pub use provider::{EventStream, Provider, ProviderError, ProviderErrorKind, ProviderEvent};
pub use types::*;
pub use wire::*;

use std::sync::Arc;

use anyhow::bail;
use smed_config::ModelConfig;

/// Construct a shared [`Provider`] from configuration.
///
/// Only the in-process test providers are wired here; real adapters are
/// registered by the embedding application.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn Provider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(EchoProvider)),
        other => bail!(
            "unknown model provider: {other:?}\n\
             This build ships no network adapters; configure provider \"mock\" \
             or register an adapter through the server API."
        ),
    }
}
