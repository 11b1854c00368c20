// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "smed", version, about = "A headless AI coding-assistant server")]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging to stderr (finer control via SMED_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind host override
        #[arg(long)]
        host: Option<String>,
        /// Bind port override
        #[arg(long)]
        port: Option<u16>,
        /// Storage root override
        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// Run one prompt headlessly and print the assistant's reply
    Run {
        /// The prompt text
        #[arg(required = true)]
        prompt: Vec<String>,

        /// Agent profile to run with
        #[arg(long, default_value = "build")]
        agent: String,

        /// Workspace directory for a newly created session
        #[arg(long, default_value = ".")]
        directory: String,

        /// Continue an existing session instead of creating one
        #[arg(long)]
        session: Option<String>,

        /// Storage root override
        #[arg(long)]
        storage: Option<PathBuf>,
    },
}
