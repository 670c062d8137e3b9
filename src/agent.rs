use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actions::translate;
use crate::cua::{from_response, MessagesRequest, ModelProvider};
use crate::events::{EventSink, LoopEvent, NullSink};
use crate::instance::{Environment, Instance, InstanceProvider};
use crate::messages::{SessionState, ToolPayload, Turn};

// ========================= Core Types =========================

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("last message must be an assistant turn")]
    NotAssistantTurn,
    #[error("cannot take computer action without a tool call in the last message")]
    NoToolCalls,
    #[error("no computer tool call found in the last message")]
    NoComputerCall,
    #[error("instance id not found in session state")]
    MissingInstance,
    #[error("unknown computer action: {0}")]
    UnknownAction(String),
    #[error("{action}: missing `{field}`")]
    MissingArgument { action: String, field: String },
    #[error("{action}: {detail}")]
    InvalidArgument { action: String, detail: String },
    #[error("model error: {0}")]
    Model(String),
    #[error("instance error: {0}")]
    Instance(String),
    #[error("artifact error: {0}")]
    Artifact(String),
    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    /// Malformed or missing pending action; retrying the same state fails the same way.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            AgentError::NotAssistantTurn
                | AgentError::NoToolCalls
                | AgentError::NoComputerCall
                | AgentError::MissingInstance
                | AgentError::UnknownAction(_)
                | AgentError::MissingArgument { .. }
                | AgentError::InvalidArgument { .. }
        )
    }
}

/// System prompt given either as bare text or as a system message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Message { role: String, content: String },
}

impl SystemPrompt {
    pub fn text(&self) -> &str {
        match self {
            SystemPrompt::Text(text) => text,
            SystemPrompt::Message { content, .. } => content,
        }
    }
}

/// What to record when the instance fails to carry out an action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Append nothing; the call stays unanswered in history.
    #[default]
    LeaveUnresolved,
    /// Append an error tool result so every call has an answer.
    SynthesizeErrorResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Screenshot { call_id: String },
    NoOutput { call_id: String },
    Failed { call_id: String, error: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopPhase {
    AwaitingModel,
    AwaitingAction,
    Done,
}

impl LoopPhase {
    /// Phase a (possibly persisted) session is in.
    pub fn of(state: &SessionState) -> Self {
        match state.last() {
            Some(Turn::Assistant { tool_calls, .. }) if tool_calls.is_empty() => LoopPhase::Done,
            Some(Turn::Assistant { .. }) => LoopPhase::AwaitingAction,
            _ => LoopPhase::AwaitingModel,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Done,
    StepLimit,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub model_steps: usize,
    pub actions: usize,
    pub failed_calls: Vec<String>,
    pub final_text: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub prompt: Option<SystemPrompt>,
    pub environment: Environment,
    pub auth_state_id: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub max_steps: usize,
    pub on_failure: FailurePolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prompt: None,
            environment: Environment::default(),
            auth_state_id: None,
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 4096,
            max_steps: 100,
            on_failure: FailurePolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `CUA_SYSTEM_PROMPT`, `CUA_ENVIRONMENT`,
    /// `CUA_AUTH_STATE_ID` and `ANTHROPIC_CUA_MODEL`.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        let mut cfg = Self::default();
        cfg.prompt = var("CUA_SYSTEM_PROMPT").map(SystemPrompt::Text);
        if let Some(raw) = var("CUA_ENVIRONMENT") {
            cfg.environment = raw
                .parse()
                .map_err(|e| AgentError::Config(format!("CUA_ENVIRONMENT: {:#}", e)))?;
        }
        cfg.auth_state_id = var("CUA_AUTH_STATE_ID");
        if let Some(model) = var("ANTHROPIC_CUA_MODEL") {
            cfg.model = model;
        }
        Ok(cfg)
    }
}

// ========================= Screenshot Artifacts =========================

#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn save(&self, run_id: &str, step: usize, base64_png: &str) -> Result<(), AgentError>;
}

pub struct DiskScreenshotStore {
    base_dir: PathBuf,
}

impl DiskScreenshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl ScreenshotStore for DiskScreenshotStore {
    async fn save(&self, run_id: &str, step: usize, base64_png: &str) -> Result<(), AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Artifact(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(base64_png)
            .map_err(|e| AgentError::Artifact(format!("b64 decode: {}", e)))?;
        async_fs::write(dir.join(format!("step_{:03}.png", step)), &png)
            .await
            .map_err(|e| AgentError::Artifact(format!("write: {}", e)))?;
        Ok(())
    }
}

// ========================= Agent Core =========================

pub struct Agent<M, I>
where
    M: ModelProvider,
    I: InstanceProvider,
{
    model: M,
    instances: I,
    cfg: AgentConfig,
    events: Arc<dyn EventSink>,
    screenshot_store: Option<Arc<dyn ScreenshotStore>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<M, I> Agent<M, I>
where
    M: ModelProvider,
    I: InstanceProvider,
{
    pub fn new(model: M, instances: I, cfg: AgentConfig) -> Self {
        Self {
            model,
            instances,
            cfg,
            events: Arc::new(NullSink),
            screenshot_store: None,
            cancel: None,
        }
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn with_screenshot_store(mut self, store: Arc<dyn ScreenshotStore>) -> Self {
        self.screenshot_store = Some(store);
        self
    }

    /// Flag checked between iterations; setting it stops the run after the current step.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Asks the model for the next assistant turn. The turn is returned, not
    /// appended, so the caller decides how to merge it.
    pub async fn call_model(&self, state: &SessionState) -> Result<Turn, AgentError> {
        let system = self.cfg.prompt.as_ref().map(SystemPrompt::text);
        let req = MessagesRequest::for_history(&self.cfg.model, self.cfg.max_tokens, system, &state.messages);
        let resp = self.model.create_message(&req).await.map_err(|e| {
            warn!(model = %self.cfg.model, turns = state.messages.len(), "model call failed: {:#}", e);
            AgentError::Model(format!("{:#}", e))
        })?;
        debug!(id = %resp.id, stop_reason = ?resp.stop_reason, blocks = resp.content.len(), "model responded");
        Ok(from_response(resp.content))
    }

    /// Executes the computer call in the latest assistant turn against the
    /// session's instance, appending a tool result when the instance returns
    /// a screenshot.
    pub async fn take_computer_action(&self, state: &mut SessionState) -> Result<ActionOutcome, AgentError> {
        let last = match state.last() {
            Some(turn @ Turn::Assistant { .. }) => turn,
            _ => return Err(AgentError::NotAssistantTurn),
        };
        if last.tool_calls().is_empty() {
            return Err(AgentError::NoToolCalls);
        }
        let call = last.computer_call().cloned().ok_or(AgentError::NoComputerCall)?;
        let instance_id = state.instance_id.clone().ok_or(AgentError::MissingInstance)?;
        let dispatch = translate(&call.args)?;

        let instance = self
            .instances
            .get(&instance_id)
            .await
            .map_err(|e| AgentError::Instance(format!("{:#}", e)))?;
        state.instance_id = Some(instance.id().to_string());

        if self.cfg.environment == Environment::Web {
            if let Some(auth_id) = &self.cfg.auth_state_id {
                if state.authenticated_id() != Some(auth_id.as_str()) {
                    info!(instance_id = %instance.id(), auth_state_id = %auth_id, "authenticating instance");
                    instance
                        .authenticate(auth_id)
                        .await
                        .map_err(|e| AgentError::Instance(format!("authenticate: {:#}", e)))?;
                    state.set_authenticated_id(auth_id.clone());
                }
            }
        }

        // The stream must be published before the first action lands.
        if state.stream_url().is_none() {
            let url = instance
                .get_stream_url()
                .await
                .map_err(|e| AgentError::Instance(format!("stream url: {:#}", e)))?;
            info!(instance_id = %instance.id(), stream_url = %url, "stream available");
            state.set_stream_url(url.clone());
            self.events.emit(LoopEvent::StreamUrl { stream_url: url });
        }

        if let Some(delay) = dispatch.delay {
            sleep(delay).await;
        }
        debug!(call_id = %call.id, command = dispatch.command.name(), "dispatching");
        let error = match instance.computer(&dispatch.command).await {
            Ok(resp) => match resp.base_64_image.filter(|img| !img.is_empty()) {
                Some(image) => {
                    state.push(Turn::screenshot(call.id.clone(), image));
                    return Ok(ActionOutcome::Screenshot { call_id: call.id });
                }
                None => match resp.error {
                    Some(error) => error,
                    None => return Ok(ActionOutcome::NoOutput { call_id: call.id }),
                },
            },
            Err(e) => format!("{:#}", e),
        };

        warn!(call_id = %call.id, action = %call.args, "failed to execute computer call: {}", error);
        if self.cfg.on_failure == FailurePolicy::SynthesizeErrorResult {
            state.push(Turn::ToolResult {
                tool_call_id: call.id.clone(),
                content: ToolPayload::Text(format!("Failed to execute computer call: {}", error)),
                is_error: true,
            });
        }
        Ok(ActionOutcome::Failed { call_id: call.id, error })
    }

    /// Alternates model calls and action executions until the model answers
    /// without a tool call. `state` is updated in place, so a caller can
    /// persist it and resume after an error.
    pub async fn run(&self, state: &mut SessionState) -> Result<RunReport, AgentError> {
        let run_id = nanoid!();
        let mut report = RunReport {
            run_id: run_id.clone(),
            status: RunStatus::Done,
            model_steps: 0,
            actions: 0,
            failed_calls: Vec::new(),
            final_text: None,
        };
        let mut phase = LoopPhase::of(state);
        info!(run_id = %run_id, turns = state.messages.len(), phase = ?phase, "run started");

        loop {
            match phase {
                LoopPhase::AwaitingModel => {
                    if self.cancelled() {
                        report.status = RunStatus::Cancelled;
                        break;
                    }
                    if report.model_steps >= self.cfg.max_steps {
                        warn!(run_id = %run_id, max_steps = self.cfg.max_steps, "step budget exceeded");
                        report.status = RunStatus::StepLimit;
                        break;
                    }
                    let turn = self.call_model(state).await?;
                    report.model_steps += 1;
                    let pending = turn.tool_calls().len();
                    info!(run_id = %run_id, step = report.model_steps, pending, "model turn");
                    state.push(turn);
                    phase = if pending == 0 { LoopPhase::Done } else { LoopPhase::AwaitingAction };
                }
                LoopPhase::AwaitingAction => {
                    // only provision for a call the step can actually run
                    if state.last().and_then(Turn::computer_call).is_some() {
                        self.ensure_instance(state).await?;
                    }
                    let outcome = self.take_computer_action(state).await?;
                    report.actions += 1;
                    match &outcome {
                        ActionOutcome::Screenshot { .. } => self.store_screenshot(&run_id, report.actions, state).await,
                        ActionOutcome::NoOutput { .. } => {}
                        ActionOutcome::Failed { call_id, .. } => report.failed_calls.push(call_id.clone()),
                    }
                    info!(run_id = %run_id, step = report.model_steps, outcome = ?outcome, "action result");
                    phase = LoopPhase::AwaitingModel;
                }
                LoopPhase::Done => {
                    report.final_text = match state.last() {
                        Some(Turn::Assistant { text, .. }) if !text.is_empty() => Some(text.clone()),
                        _ => None,
                    };
                    break;
                }
            }
        }

        info!(run_id = %run_id, status = ?report.status, actions = report.actions, "run finished");
        Ok(report)
    }

    async fn ensure_instance(&self, state: &mut SessionState) -> Result<(), AgentError> {
        if state.instance_id.is_some() {
            return Ok(());
        }
        let instance = self
            .instances
            .start(self.cfg.environment)
            .await
            .map_err(|e| AgentError::Instance(format!("start: {:#}", e)))?;
        info!(instance_id = %instance.id(), environment = ?self.cfg.environment, "instance started");
        state.instance_id = Some(instance.id().to_string());
        Ok(())
    }

    async fn store_screenshot(&self, run_id: &str, step: usize, state: &SessionState) {
        let Some(store) = &self.screenshot_store else {
            return;
        };
        let image = match state.last() {
            Some(Turn::ToolResult { content, .. }) => content.image_data(),
            _ => None,
        };
        if let Some(image) = image {
            if let Err(e) = store.save(run_id, step, image).await {
                warn!(run_id = %run_id, step, "screenshot not saved: {}", e);
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|f| f.load(Ordering::Relaxed))
    }
}
