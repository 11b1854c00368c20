// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use smed_bus::{Bus, Event, EventKind};
use smed_core::{ProcessError, Processor, SessionStore};
use smed_model::Part;
use smed_permission::{AutoApprover, Checker, PermissionGate};
use smed_server::AppState;
use smed_storage::Storage;
use smed_tools::Registry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Arc::new(smed_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Serve {
            host,
            port,
            storage,
        } => {
            let bus = Bus::new();
            let store = session_store(&config, storage, &bus)?;
            let checker: Arc<dyn PermissionGate> = Arc::new(Checker::new(Arc::clone(&bus)));
            let provider = smed_model::from_config(&config.model)?;
            let processor = Arc::new(Processor::new(
                store.clone(),
                Arc::clone(&bus),
                Arc::clone(&checker),
                Arc::new(Registry::new()),
                provider,
                Arc::clone(&config),
            ));
            let state = Arc::new(AppState {
                store,
                bus,
                processor,
                permission: checker,
            });

            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("invalid bind address {host}:{port}"))?;
            smed_server::serve(addr, state).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            prompt,
            agent,
            directory,
            session,
            storage,
        } => {
            let text = prompt.join(" ");
            if text.trim().is_empty() {
                eprintln!("error: prompt must not be empty");
                return Ok(ExitCode::from(5));
            }

            let bus = Bus::new();
            let store = session_store(&config, storage, &bus)?;
            // Headless: asks are granted automatically, hard denies hold.
            let checker: Arc<dyn PermissionGate> =
                Arc::new(AutoApprover::with_trace(Arc::clone(&bus)));
            let provider = smed_model::from_config(&config.model)?;
            let processor = Processor::new(
                store.clone(),
                Arc::clone(&bus),
                checker,
                Arc::new(Registry::new()),
                provider,
                Arc::clone(&config),
            );

            // Track denials so a blocked, answerless run exits distinctly.
            let denied = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let d = Arc::clone(&denied);
            bus.subscribe(EventKind::PermissionReplied, move |e| {
                if let Event::PermissionReplied { granted: false, .. } = e {
                    d.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            });

            let session = match session {
                Some(id) => match store.session(&id) {
                    Ok(s) => s,
                    Err(smed_storage::StorageError::NotFound(_)) => {
                        eprintln!("error: session not found: {id}");
                        return Ok(ExitCode::from(6));
                    }
                    Err(e) => return Err(e.into()),
                },
                None => store.create_session(directory, None)?,
            };
            store.create_user_message(&session.id, &text)?;

            match processor.process(&session.id, &agent).await {
                Ok(message) => {
                    let parts = store.parts(&message.id)?;
                    let reply: Vec<&str> = parts
                        .iter()
                        .filter_map(|p| match p {
                            Part::Text(tp) => Some(tp.text.as_str()),
                            _ => None,
                        })
                        .collect();
                    let reply = reply.join("\n");
                    println!("{reply}");
                    let blocked = denied.load(std::sync::atomic::Ordering::SeqCst) > 0;
                    if blocked && reply.trim().is_empty() {
                        return Ok(ExitCode::from(3));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    Ok(ExitCode::from(run_exit_code(&e)))
                }
            }
        }
    }
}

fn run_exit_code(err: &ProcessError) -> u8 {
    match err {
        ProcessError::Timeout => 2,
        ProcessError::Provider(_) => 4,
        ProcessError::SessionNotFound(_) => 6,
        _ => 1,
    }
}

fn session_store(
    config: &smed_config::Config,
    storage_override: Option<PathBuf>,
    bus: &Arc<Bus>,
) -> anyhow::Result<SessionStore> {
    let root = storage_override
        .or_else(|| config.storage_dir.clone())
        .or_else(|| dirs::data_dir().map(|d| d.join("smed")))
        .context("no usable storage directory; set storage_dir in the config")?;
    Ok(SessionStore::new(
        Arc::new(Storage::new(root)),
        Arc::clone(bus),
    ))
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("SMED_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
