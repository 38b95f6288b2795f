//! The uniform debugger-backend contract.
//!
//! Both backends, the DAP proxy ([`crate::dap::DapDriver`]) and the native
//! DWARF engine ([`crate::native::NativeDriver`]), implement [`Driver`].
//! A session owns exactly one boxed driver; the dispatcher never touches a
//! backend except through this trait.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// Everything needed to start a debuggee.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
    /// Optional language hint from the agent; wins over the file extension.
    pub language: Option<String>,
}

impl LaunchConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stop_on_entry: false,
            language: None,
        }
    }
}

/// Execution-resume variants of the `debug_run` tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum RunAction {
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Restart,
}

/// Why execution is currently paused (or over).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Entry,
    Pause,
    Exit,
}

/// Result of every run operation.
#[derive(Debug, Clone, Serialize)]
pub struct StopState {
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StopState {
    pub fn new(stop_reason: StopReason) -> Self {
        Self {
            stop_reason,
            exit_code: None,
            description: None,
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            stop_reason: StopReason::Exit,
            exit_code: Some(code),
            description: None,
        }
    }

    pub fn exception(description: impl Into<String>) -> Self {
        Self {
            stop_reason: StopReason::Exception,
            exit_code: None,
            description: Some(description.into()),
        }
    }

    pub fn is_final(&self) -> bool {
        self.stop_reason == StopReason::Exit
    }
}

/// Breakpoint info as reported back to the agent. The driver owns the
/// authoritative table; the dispatcher never caches these.
#[derive(Debug, Clone, Serialize)]
pub struct BreakpointView {
    pub id: u32,
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub verified: bool,
}

/// One call-stack level. Request-scoped, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct FrameView {
    pub id: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// A rendered variable. A non-zero `variables_reference` is a driver-scoped
/// handle the agent may pass back to expand the structure.
#[derive(Debug, Clone, Serialize)]
pub struct VariableView {
    pub name: String,
    pub value: String,
    pub type_name: String,
    pub variables_reference: u32,
    pub children_count: u32,
}

impl VariableView {
    pub fn scalar(
        name: impl Into<String>,
        value: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_name: type_name.into(),
            variables_reference: 0,
            children_count: 0,
        }
    }
}

/// Variable scope selector of the `debug_inspect` tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ScopeKind {
    Locals,
    Globals,
    Arguments,
}

/// What the agent asked to inspect.
#[derive(Debug, Clone)]
pub enum InspectRequest {
    /// One-shot expression evaluation against a frame (0 = top).
    Expression { expression: String, frame_id: u32 },
    /// Expand a structure handle returned by a previous inspect.
    Variable { variables_reference: u32 },
    /// Enumerate a variable scope of a frame.
    Scope { scope: ScopeKind, frame_id: u32 },
    /// No selector given: report the call stack.
    Stack,
}

/// Inspect reply payload.
#[derive(Debug, Clone)]
pub enum InspectOutcome {
    Value(VariableView),
    Variables(Vec<VariableView>),
    Frames(Vec<FrameView>),
}

/// Which backend family a driver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[strum(serialize = "dap")]
    #[serde(rename = "dap")]
    Dap,
    #[strum(serialize = "dwarf")]
    Dwarf,
}

/// Tagged driver failure. Drivers never let backend-specific error types
/// cross this boundary; the dispatcher converts these to JSON-RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to spawn {0}: {1}")]
    SpawnFailed(String, String),
    #[error("adapter handshake failed: {0}")]
    AdapterHandshakeFailed(String),
    #[error("debuggee is not paused")]
    NotPaused,
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("no debug information indexes file {0}")]
    FileNotIndexed(String),
    #[error("no code at {0}:{1}")]
    LineHasNoCode(String, u32),
    #[error("unknown breakpoint id {0}")]
    UnknownBreakpoint(u32),
    #[error("frame {0} not found")]
    BadFrame(u32),
    #[error("unknown variables reference {0}")]
    UnknownReference(u32),
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),
}

impl DriverError {
    /// True when the backend cannot continue and the session must
    /// transition to `terminated`.
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::UnsupportedLanguage(_) => false,
            DriverError::SpawnFailed(_, _) => true,
            DriverError::AdapterHandshakeFailed(_) => true,
            DriverError::NotPaused => false,
            DriverError::BackendError(_) => true,
            DriverError::FileNotIndexed(_) => false,
            DriverError::LineHasNoCode(_, _) => false,
            DriverError::UnknownBreakpoint(_) => false,
            DriverError::BadFrame(_) => false,
            DriverError::UnknownReference(_) => false,
            DriverError::EvaluationFailed(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// The capability set every backend exposes to the dispatcher.
pub trait Driver {
    fn kind(&self) -> DriverKind;

    /// Start the debuggee. On success the debuggee is paused (at entry or
    /// ready-to-run) and the session may be reported `stopped`.
    fn launch(&mut self, config: &LaunchConfig) -> Result<()>;

    /// Resume execution and block until the next stop or exit.
    fn run(&mut self, action: RunAction) -> Result<StopState>;

    fn set_breakpoint(
        &mut self,
        file: &Path,
        line: u32,
        condition: Option<&str>,
        hit_condition: Option<&str>,
    ) -> Result<BreakpointView>;

    fn remove_breakpoint(&mut self, id: u32) -> Result<()>;

    fn list_breakpoints(&self) -> Vec<BreakpointView>;

    fn inspect(&mut self, request: &InspectRequest) -> Result<InspectOutcome>;

    /// Forcible terminate; must not fail.
    fn stop(&mut self);

    /// Leave the debuggee running but sever the session. Backends without a
    /// detach notion fall back to [`Driver::stop`].
    fn detach(&mut self) {
        self.stop();
    }
}
