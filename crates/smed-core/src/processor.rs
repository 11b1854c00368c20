// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session processor: drives the agentic loop for one session.
//!
//! One `process` call owns the whole run: it streams provider turns,
//! assembles message parts as deltas arrive, dispatches tool calls through
//! the permission gate, feeds results back, and repeats until the model
//! stops or a safety bound trips.  Every intermediate artifact is persisted
//! and announced on the bus as it happens.
//!
//! Concurrency contract: the per-run state (`message`, `parts`) lives on
//! the loop's task.  Tool invocations run on spawned tasks and report back
//! through their join handles; they never touch the loop state directly.
//! Concurrent tool calls within a turn execute in parallel and are joined
//! in call order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use smed_bus::{Bus, ErrorPayload, Event, SessionStatus};
use smed_config::{AgentConfig, Config, PermissionAction, PermissionConfig};
use smed_model::{
    FinishReason, Message, Part, PermissionRequest, PermissionType, Provider, ProviderError,
    ProviderErrorKind, ProviderEvent, ProviderRequest, Session, TokenUsage, ToolState,
};
use smed_permission::{bash, DoomLoopDetector, PermissionError, PermissionGate};
use smed_storage::StorageError;
use smed_tools::{Registry, ToolContext, ToolResult};

use crate::error::ProcessError;
use crate::history::build_history;
use crate::store::SessionStore;

/// Safety bounds and pacing for a processor run.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Provider turns per run
    pub max_steps: u32,
    /// Provider retries per run
    pub max_retries: u32,
    pub max_context_tokens: usize,
    /// Fraction of `max_context_tokens` that triggers compaction
    pub context_threshold: f32,
    /// Messages never folded by compaction
    pub min_messages_to_keep: usize,
    /// Bound on one provider stream, open to finish
    pub turn_timeout: Duration,
    /// Optional bound on a single tool invocation
    pub tool_timeout: Option<Duration>,
    pub retry_initial: Duration,
    pub retry_multiplier: u32,
    pub retry_max: Duration,
    /// Total time allowed across all retry sleeps of one run
    pub retry_total_cap: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_retries: 3,
            max_context_tokens: 150_000,
            context_threshold: 0.75,
            min_messages_to_keep: 4,
            turn_timeout: Duration::from_secs(300),
            tool_timeout: None,
            retry_initial: Duration::from_secs(1),
            retry_multiplier: 2,
            retry_max: Duration::from_secs(30),
            retry_total_cap: Duration::from_secs(120),
        }
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    /// Late subscribers read the in-progress assistant message from here.
    snapshot: Arc<Mutex<Option<(Message, Vec<Part>)>>>,
}

type Snapshot = Arc<Mutex<Option<(Message, Vec<Part>)>>>;

pub struct Processor {
    store: SessionStore,
    bus: Arc<Bus>,
    permission: Arc<dyn PermissionGate>,
    doom: Arc<DoomLoopDetector>,
    registry: Arc<Registry>,
    provider: Arc<dyn Provider>,
    config: Arc<Config>,
    limits: Limits,
    active: Mutex<HashMap<String, ActiveSession>>,
}

impl Processor {
    pub fn new(
        store: SessionStore,
        bus: Arc<Bus>,
        permission: Arc<dyn PermissionGate>,
        registry: Arc<Registry>,
        provider: Arc<dyn Provider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            bus,
            permission,
            doom: Arc::new(DoomLoopDetector::new()),
            registry,
            provider,
            config,
            limits: Limits::default(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub(crate) fn store(&self) -> &SessionStore {
        &self.store
    }

    pub(crate) fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub(crate) fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn is_processing(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Cancel a running session.  The run unwinds cooperatively: the
    /// provider stream stops, in-flight tools are cancelled, and `process`
    /// returns [`ProcessError::Aborted`].
    pub fn abort(&self, session_id: &str) -> Result<(), ProcessError> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(session_id) {
            Some(run) => {
                info!(session = %session_id, "abort requested");
                run.cancel.cancel();
                Ok(())
            }
            None => Err(ProcessError::NotProcessing(session_id.to_string())),
        }
    }

    /// The in-progress assistant message and parts, for late subscribers
    /// catching up mid-run.
    pub fn active_state(&self, session_id: &str) -> Option<(Message, Vec<Part>)> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let run = active.get(session_id)?;
        let snapshot = run.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone();
        snapshot
    }

    /// Run the agentic loop for the session's pending prompt to completion.
    /// Returns the final assistant message.
    pub async fn process(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<Message, ProcessError> {
        self.process_with_model(session_id, agent_name, None).await
    }

    /// Like [`Processor::process`] but with a per-run model override; the
    /// configured model applies when `model` is `None`.
    pub async fn process_with_model(
        &self,
        session_id: &str,
        agent_name: &str,
        model: Option<&str>,
    ) -> Result<Message, ProcessError> {
        let model = model.unwrap_or(&self.config.model.name).to_string();
        let session = match self.store.session(session_id) {
            Ok(s) => s,
            Err(StorageError::NotFound(_)) => {
                return Err(ProcessError::SessionNotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let agent = self.config.agent(agent_name);

        let (cancel, snapshot) = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(session_id) {
                return Err(ProcessError::AlreadyProcessing(session_id.to_string()));
            }
            let cancel = CancellationToken::new();
            let snapshot: Snapshot = Arc::new(Mutex::new(None));
            active.insert(
                session_id.to_string(),
                ActiveSession {
                    cancel: cancel.clone(),
                    snapshot: Arc::clone(&snapshot),
                },
            );
            (cancel, snapshot)
        };

        self.bus.publish_sync(&Event::SessionStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Busy,
        });
        info!(session = %session_id, agent = %agent_name, model = %model, "processing started");

        let result = self.run(&session, &agent, &model, &cancel, &snapshot).await;

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);

        match &result {
            Ok(_) => {
                info!(session = %session_id, "processing finished");
                self.bus.publish_sync(&Event::SessionIdle {
                    session_id: session_id.to_string(),
                });
            }
            Err(ProcessError::Aborted) => {
                info!(session = %session_id, "processing aborted");
                self.bus.publish_sync(&Event::SessionStatus {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Idle,
                });
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "processing failed");
                self.bus.publish_sync(&Event::SessionError {
                    session_id: session_id.to_string(),
                    error: ErrorPayload {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    },
                });
            }
        }
        result
    }

    async fn run(
        &self,
        session: &Session,
        agent: &AgentConfig,
        model: &str,
        cancel: &CancellationToken,
        snapshot: &Snapshot,
    ) -> Result<Message, ProcessError> {
        let mut step: u32 = 0;
        let mut retries: u32 = 0;
        let mut retry_started: Option<Instant> = None;
        let max_steps = agent.max_steps.unwrap_or(self.limits.max_steps);

        // One assistant message spans the whole run; each turn appends its
        // parts.  Only a retry replaces it with a fresh one.
        let mut message = Message::assistant(&session.id);
        self.store.save_message(&message)?;
        self.bus.publish_sync(&Event::MessageCreated {
            message: message.clone(),
        });
        let mut parts: Vec<Part> = Vec::new();
        update_snapshot(snapshot, &message, &parts);

        loop {
            if cancel.is_cancelled() {
                return Err(ProcessError::Aborted);
            }
            self.maybe_compact(&session.id, model, cancel).await?;

            match self
                .turn(session, agent, model, &mut message, &mut parts, cancel, snapshot)
                .await?
            {
                TurnResult::Done => return Ok(message),
                TurnResult::Continue => {
                    step += 1;
                    if step >= max_steps {
                        return Err(ProcessError::StepLimit(max_steps));
                    }
                }
                TurnResult::Retry(err) => {
                    let started = *retry_started.get_or_insert_with(Instant::now);
                    if retries >= self.limits.max_retries
                        || started.elapsed() >= self.limits.retry_total_cap
                    {
                        return Err(ProcessError::Provider(err));
                    }
                    let delay = self.backoff_delay(retries);
                    warn!(
                        session = %session.id,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable provider error, backing off"
                    );
                    retries += 1;
                    // Discard the partial message; the retried turn starts
                    // from a clean one.
                    self.store.delete_message(&message)?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ProcessError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    message = Message::assistant(&session.id);
                    self.store.save_message(&message)?;
                    self.bus.publish_sync(&Event::MessageCreated {
                        message: message.clone(),
                    });
                    parts.clear();
                    update_snapshot(snapshot, &message, &parts);
                }
            }
        }
    }

    fn backoff_delay(&self, retries: u32) -> Duration {
        let exp = self
            .limits
            .retry_initial
            .saturating_mul(self.limits.retry_multiplier.saturating_pow(retries));
        let capped = exp.min(self.limits.retry_max);
        // Jitter keeps a fleet of stuck sessions from thundering back in sync.
        capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    /// One provider turn: stream events into parts, run requested tools,
    /// report how the loop should proceed.
    async fn turn(
        &self,
        session: &Session,
        agent: &AgentConfig,
        model: &str,
        message: &mut Message,
        parts: &mut Vec<Part>,
        cancel: &CancellationToken,
        snapshot: &Snapshot,
    ) -> Result<TurnResult, ProcessError> {
        // Re-read: compaction may have moved the summary pointer.  The
        // in-progress assistant message is already persisted, so the
        // history naturally carries the turn's earlier tool results.
        let session = self.store.session(&session.id)?;
        let stored = self.store.messages_with_parts(&session.id)?;
        let request = ProviderRequest {
            messages: build_history(&session, &stored),
            tools: self.registry.schemas_for_agent(agent),
            model: model.to_string(),
            temperature: self.config.model.temperature,
            max_tokens: self.config.model.max_tokens,
        };

        // Everything spawned for this turn dies with this token, so a retry
        // or abort discards the turn wholesale.
        let turn_cancel = cancel.child_token();
        let deadline = tokio::time::Instant::now() + self.limits.turn_timeout;
        let mut tool_tasks: Vec<(String, JoinHandle<ToolOutcome>)> = Vec::new();
        // Text never coalesces across turns: only a text part opened in
        // this turn may be extended by this turn's deltas.
        let turn_start = parts.len();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.mark_aborted(message, parts)?;
                return Err(ProcessError::Aborted);
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.mark_aborted(message, parts)?;
                return Err(ProcessError::Timeout);
            }
            r = self.provider.stream(request) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.retryable => {
                return Ok(TurnResult::Retry(e));
            }
            Err(e) => {
                self.record_message_error(message, &e)?;
                return Err(ProcessError::Provider(e));
            }
        };

        let mut pending_args: HashMap<String, String> = HashMap::new();
        let mut finish: Option<FinishReason> = None;
        let mut stream_error: Option<ProviderError> = None;
        let mut usage_seen = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    turn_cancel.cancel();
                    abandon_tasks(tool_tasks);
                    self.mark_aborted(message, parts)?;
                    return Err(ProcessError::Aborted);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    turn_cancel.cancel();
                    abandon_tasks(tool_tasks);
                    self.mark_aborted(message, parts)?;
                    return Err(ProcessError::Timeout);
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };

            match event {
                ProviderEvent::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    // Successive deltas extend the trailing text part, but
                    // only one opened in this turn; a new part opens at the
                    // turn start or when text resumes after a tool call.
                    let turn_has_parts = parts.len() > turn_start;
                    let appended = match parts.last_mut() {
                        Some(Part::Text(tp)) if turn_has_parts => {
                            tp.text.push_str(&delta);
                            true
                        }
                        _ => false,
                    };
                    if !appended {
                        parts.push(Part::text(&message.id, delta.clone()));
                    }
                    if let Some(part) = parts.last() {
                        self.store.save_part(part)?;
                        self.bus.publish_sync(&Event::PartUpdated {
                            part: part.clone(),
                            delta: Some(delta),
                        });
                    }
                }
                ProviderEvent::ToolCallStart { call_id, tool } => {
                    let part = Part::tool(&message.id, &tool, &call_id);
                    self.store.save_part(&part)?;
                    parts.push(part.clone());
                    pending_args.insert(call_id, String::new());
                    self.bus.publish_sync(&Event::PartUpdated { part, delta: None });
                }
                ProviderEvent::ToolCallArgumentsDelta { call_id, fragment } => {
                    pending_args.entry(call_id.clone()).or_default().push_str(&fragment);
                    if let Some(part) = parts
                        .iter()
                        .find(|p| p.as_tool().is_some_and(|t| t.call_id == call_id))
                    {
                        self.bus.publish_sync(&Event::PartUpdated {
                            part: part.clone(),
                            delta: None,
                        });
                    }
                }
                ProviderEvent::ToolCallEnd { call_id } => {
                    let buffer = pending_args.remove(&call_id).unwrap_or_default();
                    let input = parse_arguments(&call_id, &buffer);
                    let Some(idx) = parts
                        .iter()
                        .position(|p| p.as_tool().is_some_and(|t| t.call_id == call_id))
                    else {
                        warn!(call = %call_id, "tool call end without a start; dropping");
                        continue;
                    };
                    let tool_name = {
                        let Some(tp) = parts[idx].as_tool_mut() else {
                            continue;
                        };
                        tp.state = ToolState::Running {
                            input: input.clone(),
                        };
                        tp.tool.clone()
                    };
                    self.store.save_part(&parts[idx])?;
                    self.bus.publish_sync(&Event::PartUpdated {
                        part: parts[idx].clone(),
                        delta: None,
                    });
                    let task =
                        self.spawn_tool(&session, agent, &call_id, &tool_name, input, &turn_cancel);
                    tool_tasks.push((call_id, task));
                }
                ProviderEvent::UsageUpdate { input, output } => {
                    usage_seen = true;
                    message.tokens = Some(TokenUsage { input, output });
                    self.store.save_message(message)?;
                    self.bus.publish_sync(&Event::MessageUpdated {
                        message: message.clone(),
                    });
                }
                ProviderEvent::Finish(reason) => {
                    finish = Some(reason);
                    break;
                }
                ProviderEvent::Error(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
            update_snapshot(snapshot, message, parts);
        }
        // Stop consuming promptly; the provider ends the stream after a
        // finish or error anyway.
        drop(stream);

        if let Some(e) = stream_error {
            turn_cancel.cancel();
            abandon_tasks(tool_tasks);
            if e.retryable {
                return Ok(TurnResult::Retry(e));
            }
            self.record_message_error(message, &e)?;
            return Err(ProcessError::Provider(e));
        }

        // Await tool executions in call order; their outputs become inputs
        // to the next provider turn.
        for (call_id, mut task) in tool_tasks {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    turn_cancel.cancel();
                    task.abort();
                    self.mark_aborted(message, parts)?;
                    return Err(ProcessError::Aborted);
                }
                r = &mut task => r,
            };
            let outcome = joined
                .unwrap_or_else(|e| ToolOutcome::Failed(format!("tool task panicked: {e}")));
            self.apply_tool_outcome(&session, parts, &call_id, outcome)?;
            update_snapshot(snapshot, message, parts);
        }

        // Turns with tool calls ran them in this turn; the turn's tool
        // parts are the ones appended since `turn_start`.
        let turn_had_tools = parts[turn_start..]
            .iter()
            .any(|p| matches!(p, Part::Tool(_)));
        message.finish = finish;
        self.store.save_message(message)?;
        if !usage_seen {
            self.bus.publish_sync(&Event::MessageUpdated {
                message: message.clone(),
            });
        }
        update_snapshot(snapshot, message, parts);

        match (finish, turn_had_tools) {
            (Some(FinishReason::Stop), false) => Ok(TurnResult::Done),
            (Some(FinishReason::Stop), true) | (Some(FinishReason::ToolUse), _) => {
                Ok(TurnResult::Continue)
            }
            (Some(FinishReason::Length), _) => Err(ProcessError::OutputLength),
            (Some(FinishReason::Error), _) => Err(ProcessError::Provider(ProviderError::fatal(
                ProviderErrorKind::Other,
                "provider reported an error finish",
            ))),
            (None, _) => Err(ProcessError::Provider(ProviderError::fatal(
                ProviderErrorKind::MalformedStream,
                "stream ended without a finish reason",
            ))),
        }
    }

    fn spawn_tool(
        &self,
        session: &Session,
        agent: &AgentConfig,
        call_id: &str,
        tool_name: &str,
        input: serde_json::Value,
        turn_cancel: &CancellationToken,
    ) -> JoinHandle<ToolOutcome> {
        let registry = Arc::clone(&self.registry);
        let permission = Arc::clone(&self.permission);
        let doom = Arc::clone(&self.doom);
        let perms = agent.permissions.clone();
        let session_id = session.id.clone();
        let directory = PathBuf::from(&session.directory);
        let tool_name = tool_name.to_string();
        let call_id = call_id.to_string();
        let cancel = turn_cancel.clone();
        let tool_timeout = self.limits.tool_timeout;
        debug!(session = %session_id, call = %call_id, tool = %tool_name, "tool scheduled");
        tokio::spawn(async move {
            let fut = execute_tool(
                registry, permission, doom, perms, session_id, directory, tool_name, input, cancel,
            );
            match tool_timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .unwrap_or_else(|_| ToolOutcome::Failed("tool timed out".to_string())),
                None => fut.await,
            }
        })
    }

    fn apply_tool_outcome(
        &self,
        session: &Session,
        parts: &mut [Part],
        call_id: &str,
        outcome: ToolOutcome,
    ) -> Result<(), ProcessError> {
        let Some(idx) = parts
            .iter()
            .position(|p| p.as_tool().is_some_and(|t| t.call_id == call_id))
        else {
            return Ok(());
        };
        let (state_error, result) = match outcome {
            ToolOutcome::Completed(result) => (None, Some(result)),
            ToolOutcome::Failed(msg) | ToolOutcome::Rejected(msg) => (Some(msg), None),
            ToolOutcome::Cancelled => (Some("aborted".to_string()), None),
        };
        let edited: Vec<String> = result
            .as_ref()
            .map(|r| r.edited.clone())
            .unwrap_or_default();
        if let Some(tp) = parts[idx].as_tool_mut() {
            let input = tp
                .state
                .input()
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            tp.state = match (state_error, result) {
                (None, Some(r)) => ToolState::Completed {
                    input,
                    output: r.output,
                    metadata: r.metadata,
                },
                (Some(error), _) => ToolState::Error { input, error },
                (None, None) => unreachable!("outcome always yields a result or an error"),
            };
        }
        self.store.save_part(&parts[idx])?;
        self.bus.publish_sync(&Event::PartUpdated {
            part: parts[idx].clone(),
            delta: None,
        });
        for path in edited {
            self.bus.publish_sync(&Event::FileEdited {
                session_id: session.id.clone(),
                path,
            });
        }
        Ok(())
    }

    /// Persist the aborted shape of the turn without publishing further
    /// events: running tool parts become `Error("aborted")`, the message
    /// records the abort.  The terminal `session.status` is the caller's.
    fn mark_aborted(
        &self,
        message: &mut Message,
        parts: &mut [Part],
    ) -> Result<(), ProcessError> {
        for part in parts.iter_mut() {
            let Some(tp) = part.as_tool_mut() else { continue };
            if tp.state.is_terminal() {
                continue;
            }
            let input = tp
                .state
                .input()
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            tp.state = ToolState::Error {
                input,
                error: "aborted".to_string(),
            };
        }
        for part in parts.iter() {
            if part.as_tool().is_some() {
                self.store.save_part(part)?;
            }
        }
        message.error = Some("aborted".to_string());
        self.store.save_message(message)?;
        Ok(())
    }

    fn record_message_error(
        &self,
        message: &mut Message,
        error: &ProviderError,
    ) -> Result<(), ProcessError> {
        message.error = Some(error.to_string());
        self.store.save_message(message)?;
        self.bus.publish_sync(&Event::MessageUpdated {
            message: message.clone(),
        });
        Ok(())
    }
}

enum TurnResult {
    /// Model stopped with no tool calls; the run is complete.
    Done,
    /// Tool results are in; take another provider turn.
    Continue,
    /// Retryable provider failure; the caller discards the partial message.
    Retry(ProviderError),
}

enum ToolOutcome {
    Completed(ToolResult),
    Failed(String),
    Rejected(String),
    Cancelled,
}

fn update_snapshot(snapshot: &Snapshot, message: &Message, parts: &[Part]) {
    *snapshot.lock().unwrap_or_else(|e| e.into_inner()) =
        Some((message.clone(), parts.to_vec()));
}

fn abandon_tasks(tasks: Vec<(String, JoinHandle<ToolOutcome>)>) {
    for (_, task) in tasks {
        task.abort();
    }
}

fn parse_arguments(call_id: &str, buffer: &str) -> serde_json::Value {
    if buffer.is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    match serde_json::from_str(buffer) {
        Ok(v) => v,
        Err(e) => {
            warn!(call = %call_id, error = %e, "tool arguments are not valid JSON; substituting {{}}");
            serde_json::Value::Object(Default::default())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_tool(
    registry: Arc<Registry>,
    permission: Arc<dyn PermissionGate>,
    doom: Arc<DoomLoopDetector>,
    perms: PermissionConfig,
    session_id: String,
    directory: PathBuf,
    tool_name: String,
    input: serde_json::Value,
    cancel: CancellationToken,
) -> ToolOutcome {
    let Some(tool) = registry.get(&tool_name) else {
        return ToolOutcome::Failed(format!("unknown tool: {tool_name}"));
    };

    // The doom-loop check runs before the configured gate: a repeated call
    // is questioned even when its action would be allow.
    let doomed = doom.check(&session_id, &tool_name, &input);
    let gate = if doomed {
        Some((
            PermissionRequest {
                id: String::new(),
                session_id: session_id.clone(),
                kind: PermissionType::DoomLoop,
                patterns: Vec::new(),
                title: format!("doom loop: {tool_name} repeated with identical input"),
                metadata: serde_json::json!({
                    "tool": tool_name,
                    "fingerprint": smed_permission::fingerprint_hex(&tool_name, &input),
                }),
            },
            PermissionAction::Ask,
        ))
    } else {
        classify_permission(&perms, &session_id, tool.permission(), &tool_name, &input)
    };

    if let Some((request, action)) = gate {
        match permission.check(&cancel, request, action).await {
            Ok(()) => {}
            Err(PermissionError::Rejected(title)) => {
                if doomed {
                    doom.reset(&session_id);
                }
                return ToolOutcome::Rejected(format!("permission rejected: {title}"));
            }
            Err(PermissionError::Cancelled) => return ToolOutcome::Cancelled,
        }
    }

    let ctx = ToolContext {
        session_id,
        directory,
        cancel: cancel.clone(),
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => ToolOutcome::Cancelled,
        r = tool.invoke(&ctx, input) => match r {
            Ok(result) => ToolOutcome::Completed(result),
            Err(e) => ToolOutcome::Failed(e.to_string()),
        },
    }
}

/// Map a tool call onto the agent's permission configuration.
fn classify_permission(
    perms: &PermissionConfig,
    session_id: &str,
    kind: Option<PermissionType>,
    tool_name: &str,
    input: &serde_json::Value,
) -> Option<(PermissionRequest, PermissionAction)> {
    let kind = kind?;
    let request = |patterns: Vec<String>, title: String| PermissionRequest {
        id: String::new(),
        session_id: session_id.to_string(),
        kind,
        patterns,
        title,
        metadata: input.clone(),
    };
    match kind {
        PermissionType::Bash => {
            let command = input
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let commands = bash::parse_bash(command);
            let action = bash::match_bash_command_line(&perms.bash, &commands, perms.default);
            let patterns = commands.iter().map(bash::BashCommand::pattern).collect();
            Some((request(patterns, command.to_string()), action))
        }
        PermissionType::Edit => {
            let target = input
                .get("file_path")
                .and_then(|v| v.as_str())
                .unwrap_or("<unknown>");
            Some((request(Vec::new(), format!("{tool_name}: {target}")), perms.edit))
        }
        PermissionType::Webfetch => {
            let url = input.get("url").and_then(|v| v.as_str()).unwrap_or("<unknown>");
            Some((request(Vec::new(), format!("fetch: {url}")), perms.webfetch))
        }
        PermissionType::ExternalDirectory => {
            let target = input
                .get("file_path")
                .or_else(|| input.get("path"))
                .and_then(|v| v.as_str())
                .unwrap_or("<unknown>");
            Some((
                request(Vec::new(), format!("outside workspace: {target}")),
                perms.external_directory,
            ))
        }
        PermissionType::DoomLoop => Some((
            request(Vec::new(), format!("doom loop: {tool_name}")),
            PermissionAction::Ask,
        )),
    }
}
