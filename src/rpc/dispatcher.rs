//! The tool dispatcher: decodes JSON-RPC requests, routes the five debug
//! tools to driver operations and formats replies and errors.

use crate::config::Settings;
use crate::driver::{
    Driver, DriverError, DriverKind, InspectOutcome, InspectRequest, LaunchConfig, RunAction,
    ScopeKind,
};
use crate::rpc::{self, tools, Request, Response};
use crate::sandbox::SandboxPolicy;
use crate::session::{OrphanAction, Session, SessionManager, SessionStatus};
use nix::unistd::{getppid, Pid};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Constructs a backend for a launch request. Swappable so tests can inject
/// scripted drivers.
pub trait DriverFactory {
    fn create(&self, kind: DriverKind, config: &LaunchConfig) -> crate::driver::Result<Box<dyn Driver>>;
}

/// Production factory: DAP proxy or native DWARF engine, both confined by
/// the sandbox policy.
pub struct BackendFactory {
    settings: Settings,
    sandbox: SandboxPolicy,
}

impl BackendFactory {
    pub fn new(settings: Settings, sandbox: SandboxPolicy) -> Self {
        Self { settings, sandbox }
    }
}

impl DriverFactory for BackendFactory {
    fn create(
        &self,
        kind: DriverKind,
        _config: &LaunchConfig,
    ) -> crate::driver::Result<Box<dyn Driver>> {
        match kind {
            DriverKind::Dap => Ok(Box::new(crate::dap::DapDriver::new(
                self.settings.clone(),
                self.sandbox.clone(),
            ))),
            DriverKind::Dwarf => Ok(Box::new(crate::native::NativeDriver::new(
                self.settings.clone(),
                self.sandbox.clone(),
            ))),
        }
    }
}

/// A tool-level failure carrying its JSON-RPC error code.
struct ToolFailure {
    code: i64,
    message: String,
}

impl ToolFailure {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: rpc::INVALID_PARAMS,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: rpc::INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

type ToolResult = Result<Value, ToolFailure>;

/// The gateway's message handler. Owns the session table and the transport
/// stays outside: callers feed it one decoded line at a time.
pub struct Dispatcher {
    sessions: SessionManager,
    factory: Box<dyn DriverFactory>,
    project_dir: PathBuf,
    owner_pid: Option<Pid>,
    orphan_action: OrphanAction,
}

impl Dispatcher {
    pub fn new(factory: Box<dyn DriverFactory>, project_dir: PathBuf) -> Self {
        Self {
            sessions: SessionManager::new(),
            factory,
            project_dir,
            owner_pid: Some(getppid()),
            orphan_action: OrphanAction::default(),
        }
    }

    /// Handle one inbound line. `None` means no reply (notification).
    pub fn handle_line(&mut self, line: &str) -> Option<String> {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                log::warn!(target: "dispatcher", "parse error: {e}");
                return Some(
                    Response::failure(Value::Null, rpc::PARSE_ERROR, format!("parse error: {e}"))
                        .to_line(),
                );
            }
        };

        if request.jsonrpc.as_deref() != Some("2.0") {
            let id = request.id.unwrap_or(Value::Null);
            return Some(
                Response::failure(id, rpc::INVALID_REQUEST, "expected jsonrpc \"2.0\"").to_line(),
            );
        }

        if request.is_notification() {
            log::debug!(target: "dispatcher", "notification: {}", request.method);
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        log::debug!(target: "dispatcher", "request {id}: {}", request.method);

        let response = match request.method.as_str() {
            "initialize" => Response::success(id, self.initialize_result()),
            "ping" => Response::success(id, json!({})),
            "tools/list" => Response::success_raw(id, tools::catalog()),
            "tools/call" => match self.tools_call(&request.params) {
                Ok(result) => Response::success(id, result),
                Err(failure) => Response::failure(id, failure.code, failure.message),
            },
            other => Response::failure(
                id,
                rpc::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        };
        Some(response.to_line())
    }

    /// Destroy every session in creation order; each driver's stop runs.
    pub fn shutdown(&mut self) {
        self.sessions.shutdown();
    }

    /// Apply the orphan policy between messages.
    pub fn reap_orphans(&mut self) {
        self.sessions.reap_orphans();
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "cog-debug",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    fn tools_call(&mut self, params: &Value) -> ToolResult {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolFailure::invalid_params("missing required field `name`"))?;
        let default_args = json!({});
        let args = params.get("arguments").unwrap_or(&default_args);

        match name {
            "debug_launch" => self.debug_launch(args),
            "debug_breakpoint" => self.debug_breakpoint(args),
            "debug_run" => self.debug_run(args),
            "debug_inspect" => self.debug_inspect(args),
            "debug_stop" => self.debug_stop(args),
            other => Err(ToolFailure {
                code: rpc::METHOD_NOT_FOUND,
                message: format!("unknown tool: {other}"),
            }),
        }
    }

    // ---------------------------------- tools ----------------------------------

    fn debug_launch(&mut self, args: &Value) -> ToolResult {
        let program = required_str(args, "program")?;
        let mut config = LaunchConfig::new(self.absolutize(Path::new(program)));
        if let Some(list) = args.get("args").and_then(Value::as_array) {
            config.args = list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(env) = args.get("env").and_then(Value::as_object) {
            config.env = env
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
        }
        config.cwd = args
            .get("cwd")
            .and_then(Value::as_str)
            .map(|c| self.absolutize(Path::new(c)));
        config.stop_on_entry = args
            .get("stop_on_entry")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        config.language = args
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);

        let kind = choose_backend(config.language.as_deref(), &config.program);
        log::info!(
            target: "dispatcher",
            "launching {} via {kind}",
            config.program.display()
        );

        let mut driver = self
            .factory
            .create(kind, &config)
            .map_err(|e| ToolFailure::internal(e.to_string()))?;
        driver
            .launch(&config)
            .map_err(|e| ToolFailure::internal(e.to_string()))?;

        let id = self
            .sessions
            .create(driver, self.owner_pid, self.orphan_action);
        let session = self.sessions.get(&id).expect("just created");
        session.set_status(SessionStatus::Stopped);

        Ok(json!({ "session_id": id, "status": SessionStatus::Stopped }))
    }

    fn debug_breakpoint(&mut self, args: &Value) -> ToolResult {
        let session_id = required_str(args, "session_id")?.to_string();
        let action = required_str(args, "action")?.to_string();

        match action.as_str() {
            "set" => {
                let file = self.absolutize(Path::new(required_str(args, "file")?));
                let line = required_u32(args, "line")?;
                let condition = args.get("condition").and_then(Value::as_str);
                let hit_condition = args.get("hit_condition").and_then(Value::as_str);

                let result = self
                    .lookup(&session_id)?
                    .driver
                    .set_breakpoint(&file, line, condition, hit_condition);
                match result {
                    Ok(view) => Ok(json!({ "breakpoints": [view] })),
                    Err(e) => Err(self.fail_driver(&session_id, e)),
                }
            }
            "remove" => {
                let id = required_u32(args, "id")?;
                let result = self.lookup(&session_id)?.driver.remove_breakpoint(id);
                match result {
                    Ok(()) => Ok(json!({ "removed": true })),
                    Err(e) => Err(self.fail_driver(&session_id, e)),
                }
            }
            "list" => {
                let session = self.lookup(&session_id)?;
                Ok(json!({ "breakpoints": session.driver.list_breakpoints() }))
            }
            other => Err(ToolFailure::invalid_params(format!(
                "unknown breakpoint action `{other}` (expected set, remove or list)"
            ))),
        }
    }

    fn debug_run(&mut self, args: &Value) -> ToolResult {
        let session_id = required_str(args, "session_id")?.to_string();
        let action = required_str(args, "action")?;
        let action = RunAction::from_str(action).map_err(|_| {
            ToolFailure::invalid_params(format!(
                "unknown run action `{action}` (expected continue, step_into, step_over, step_out or restart)"
            ))
        })?;

        let session = self.lookup(&session_id)?;
        session
            .ensure_stopped()
            .map_err(|e| ToolFailure::invalid_params(e.to_string()))?;

        session.set_status(SessionStatus::Running);
        let stop = match session.driver.run(action) {
            Ok(stop) => stop,
            Err(e) => {
                // a refused resume leaves the session paused where it was
                if !e.is_fatal() {
                    session.set_status(SessionStatus::Stopped);
                }
                return Err(self.fail_driver(&session_id, e));
            }
        };

        let status = if stop.is_final() {
            SessionStatus::Terminated
        } else {
            SessionStatus::Stopped
        };
        session.set_status(status);

        let mut result = serde_json::to_value(&stop).expect("stop state serializes");
        result["status"] = serde_json::to_value(status).expect("status serializes");

        if stop.is_final() {
            // driver reported exit: the session's lifetime ends here
            let _ = self.sessions.destroy(&session_id);
        }
        Ok(result)
    }

    fn debug_inspect(&mut self, args: &Value) -> ToolResult {
        let session_id = required_str(args, "session_id")?.to_string();
        let frame_id = args
            .get("frame_id")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let request = if let Some(expression) = args.get("expression").and_then(Value::as_str) {
            InspectRequest::Expression {
                expression: expression.to_string(),
                frame_id,
            }
        } else if let Some(reference) = args.get("variable_ref").and_then(Value::as_u64) {
            InspectRequest::Variable {
                variables_reference: reference as u32,
            }
        } else if let Some(scope) = args.get("scope").and_then(Value::as_str) {
            let scope = ScopeKind::from_str(scope).map_err(|_| {
                ToolFailure::invalid_params(format!(
                    "unknown scope `{scope}` (expected locals, globals or arguments)"
                ))
            })?;
            InspectRequest::Scope { scope, frame_id }
        } else {
            InspectRequest::Stack
        };

        let session = self.lookup(&session_id)?;
        session
            .ensure_stopped()
            .map_err(|e| ToolFailure::invalid_params(e.to_string()))?;

        let outcome = match session.driver.inspect(&request) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail_driver(&session_id, e)),
        };

        Ok(match outcome {
            InspectOutcome::Value(v) => json!({
                "value": v.value,
                "type": v.type_name,
                "variables_reference": v.variables_reference,
                "children_count": v.children_count,
            }),
            InspectOutcome::Variables(vars) => json!({ "variables": vars }),
            InspectOutcome::Frames(frames) => json!({ "frames": frames }),
        })
    }

    fn debug_stop(&mut self, args: &Value) -> ToolResult {
        let session_id = required_str(args, "session_id")?.to_string();
        let session = self.lookup(&session_id)?;
        // best effort; destruction is unconditional
        session.driver.stop();
        let _ = self.sessions.destroy(&session_id);
        Ok(json!({ "stopped": true }))
    }

    // --------------------------------- helpers ---------------------------------

    fn lookup(&mut self, session_id: &str) -> Result<&mut Session, ToolFailure> {
        if !self.sessions.contains(session_id) {
            let known: Vec<_> = self.sessions.list().into_iter().map(|s| s.id).collect();
            return Err(ToolFailure::invalid_params(format!(
                "unknown session {session_id}; live sessions: [{}]",
                known.join(", ")
            )));
        }
        Ok(self.sessions.get(session_id).expect("checked above"))
    }

    /// Convert a driver failure into a JSON-RPC internal error. A backend
    /// that cannot continue takes its session down with it: the driver and
    /// every subprocess it owns are released, and the id leaves the table.
    fn fail_driver(&mut self, session_id: &str, err: DriverError) -> ToolFailure {
        if err.is_fatal() {
            log::warn!(
                target: "dispatcher",
                "backend failure ends {session_id}: {err}"
            );
            if let Ok(session) = self.sessions.get(session_id) {
                session.set_status(SessionStatus::Terminated);
                session.driver.stop();
            }
            let _ = self.sessions.destroy(session_id);
        }
        ToolFailure::internal(err.to_string())
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// `.py .js .go .java` → DAP; everything else → native DWARF engine.
/// An explicit language hint wins over the extension.
fn choose_backend(language: Option<&str>, program: &Path) -> DriverKind {
    if let Some(lang) = language {
        return match lang.to_ascii_lowercase().as_str() {
            "python" | "py" | "javascript" | "js" | "node" | "go" | "golang" | "java" => {
                DriverKind::Dap
            }
            _ => DriverKind::Dwarf,
        };
    }
    match program.extension().and_then(|e| e.to_str()) {
        Some("py") | Some("js") | Some("go") | Some("java") => DriverKind::Dap,
        _ => DriverKind::Dwarf,
    }
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolFailure> {
    args.get(field).and_then(Value::as_str).ok_or_else(|| {
        ToolFailure::invalid_params(format!("missing required field `{field}`"))
    })
}

fn required_u32(args: &Value, field: &str) -> Result<u32, ToolFailure> {
    args.get(field).and_then(Value::as_u64).map(|v| v as u32).ok_or_else(|| {
        ToolFailure::invalid_params(format!("missing required field `{field}`"))
    })
}
