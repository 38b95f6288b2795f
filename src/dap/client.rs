//! The DAP proxy: one adapter subprocess per session, request/response
//! correlation by `seq`, and translation of adapter events into
//! driver-level stop states.
//!
//! Every run operation is synchronous at the driver surface: the request is
//! sent, its response is consumed, and the call returns only once a
//! `stopped`, `exited` or `terminated` event arrives.

use crate::config::Settings;
use crate::dap::adapters;
use crate::dap::protocol::{self, DapResponse, Event, Message, SourceBreakpoint};
use crate::dap::transport::{FramedReader, FramedWriter, FramingError};
use crate::driver::{
    BreakpointView, Driver, DriverError, DriverKind, FrameView, InspectOutcome, InspectRequest,
    LaunchConfig, RunAction, StopReason, StopState, VariableView,
};
use crate::sandbox::SandboxPolicy;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use timeout_readwrite::TimeoutReader;

/// Protocol progress of one adapter subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Spawned,
    Initialized,
    Launched,
    Paused,
    AwaitingStop,
    Done,
}

struct Proxy {
    child: Child,
    reader: FramedReader<TimeoutReader<ChildStdout>>,
    writer: FramedWriter<ChildStdin>,
    seq: i64,
    /// Current thread id: initially 1, updated from `stopped.threadId`.
    thread_id: i64,
    state: ProxyState,
    /// Events observed while waiting for something else.
    deferred: VecDeque<Event>,
}

fn backend_error(e: FramingError) -> DriverError {
    if e.is_timeout() {
        DriverError::BackendError("adapter round-trip timed out".into())
    } else {
        DriverError::BackendError(e.to_string())
    }
}

impl Proxy {
    fn send(&mut self, command: &str, arguments: Value) -> Result<i64, DriverError> {
        self.seq += 1;
        let seq = self.seq;
        log::debug!(target: "dap", "-> {command} (seq {seq})");
        self.writer
            .write_message(&protocol::request(seq, command, arguments))
            .map_err(backend_error)?;
        Ok(seq)
    }

    fn recv(&mut self) -> Result<Message, DriverError> {
        let value = self.reader.read_message().map_err(backend_error)?;
        Ok(protocol::classify(value))
    }

    /// Park an event for later, reacting to the ones with immediate effect.
    fn note_event(&mut self, event: &protocol::DapEvent) -> Result<(), DriverError> {
        match event.parse() {
            Event::Output { category, output } => {
                log::info!(target: "debuggee", "[{category}] {}", output.trim_end());
            }
            Event::Initialized => {
                // the adapter is ready for breakpoint configuration; the
                // response is consumed as stale in a later wait
                self.send("configurationDone", Value::Object(Default::default()))?;
            }
            Event::Continued | Event::Thread => {}
            Event::Other(name) => {
                log::debug!(target: "dap", "ignoring event {name}");
            }
            parsed => self.deferred.push_back(parsed),
        }
        Ok(())
    }

    /// Read until the response for `seq` arrives. Events seen on the way are
    /// parked; stale responses are dropped.
    fn wait_response(&mut self, seq: i64) -> Result<DapResponse, DriverError> {
        loop {
            match self.recv()? {
                Message::Response(response) if response.request_seq == seq => {
                    log::debug!(
                        target: "dap",
                        "<- response {} (seq {seq}, success {})",
                        response.command, response.success
                    );
                    return Ok(response);
                }
                Message::Response(stale) => {
                    log::debug!(target: "dap", "dropping stale response for seq {}", stale.request_seq);
                }
                Message::Event(event) => self.note_event(&event)?,
                Message::Unknown(value) => {
                    log::debug!(target: "dap", "unknown message: {value}");
                }
            }
        }
    }

    /// Block until a stop-worthy event arrives. The response for
    /// `resume_seq` is consumed on the way and completes the call only when
    /// the adapter refused the resume outright.
    fn wait_stop(&mut self, resume_seq: Option<i64>) -> Result<StopState, DriverError> {
        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => match self.recv()? {
                    Message::Event(event) => {
                        self.note_event(&event)?;
                        continue;
                    }
                    Message::Response(response) => {
                        if Some(response.request_seq) == resume_seq && !response.success {
                            self.state = ProxyState::Paused;
                            return Err(DriverError::BackendError(format!(
                                "adapter refused {}: {}",
                                response.command,
                                response.message.unwrap_or_default()
                            )));
                        }
                        continue;
                    }
                    Message::Unknown(value) => {
                        log::debug!(target: "dap", "unknown message: {value}");
                        continue;
                    }
                },
            };

            match event {
                Event::Stopped { reason, thread_id } => {
                    if let Some(tid) = thread_id {
                        self.thread_id = tid;
                    }
                    self.state = ProxyState::Paused;
                    log::debug!(target: "dap", "stopped: {reason} (thread {})", self.thread_id);
                    return Ok(StopState::new(stop_reason_of(&reason)));
                }
                Event::Exited { exit_code } => {
                    self.state = ProxyState::Done;
                    return Ok(StopState::exited(exit_code));
                }
                Event::Terminated => {
                    self.state = ProxyState::Done;
                    return Ok(StopState {
                        stop_reason: StopReason::Exit,
                        exit_code: None,
                        description: None,
                    });
                }
                other => {
                    log::debug!(target: "dap", "ignoring deferred event {other:?}");
                }
            }
        }
    }
}

fn stop_reason_of(reason: &str) -> StopReason {
    if reason.contains("breakpoint") {
        return StopReason::Breakpoint;
    }
    match reason {
        "step" | "goto" => StopReason::Step,
        "entry" => StopReason::Entry,
        "pause" => StopReason::Pause,
        "exception" => StopReason::Exception,
        _ => StopReason::Pause,
    }
}

/// Bookkeeping for one driver-assigned breakpoint id.
#[derive(Debug, Clone)]
struct BreakpointRecord {
    id: u32,
    file: PathBuf,
    line: u32,
    condition: Option<String>,
    verified: bool,
}

/// Driver over a spawned DAP adapter.
pub struct DapDriver {
    settings: Settings,
    sandbox: SandboxPolicy,
    proxy: Option<Proxy>,
    launch_config: Option<LaunchConfig>,
    /// Replace-all lists per source file, mirrored to the adapter.
    source_breakpoints: HashMap<PathBuf, Vec<SourceBreakpoint>>,
    records: Vec<BreakpointRecord>,
    next_breakpoint_id: u32,
}

impl DapDriver {
    pub fn new(settings: Settings, sandbox: SandboxPolicy) -> Self {
        Self {
            settings,
            sandbox,
            proxy: None,
            launch_config: None,
            source_breakpoints: HashMap::new(),
            records: Vec::new(),
            next_breakpoint_id: 1,
        }
    }

    fn spawn_adapter(&self, config: &LaunchConfig) -> Result<(Child, &'static str), DriverError> {
        let adapter = adapters::resolve(config)?;
        let (program, args) = self
            .sandbox
            .wrap_command(&adapter.program, &adapter.args)
            .map_err(|e| DriverError::SpawnFailed(adapter.program.clone(), e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // adapter diagnostics land next to our own logs
            .stderr(Stdio::inherit());
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let child = command
            .spawn()
            .map_err(|e| DriverError::SpawnFailed(program.clone(), e.to_string()))?;
        log::info!(target: "dap", "spawned adapter {program} (pid {})", child.id());
        Ok((child, adapter.adapter_id))
    }

    fn handshake(
        proxy: &mut Proxy,
        adapter_id: &str,
        config: &LaunchConfig,
    ) -> Result<(), DriverError> {
        let seq = proxy.send("initialize", protocol::initialize_args(adapter_id))?;
        let response = proxy
            .wait_response(seq)
            .map_err(|e| DriverError::AdapterHandshakeFailed(e.to_string()))?;
        if !response.success {
            return Err(DriverError::AdapterHandshakeFailed(
                response.message.unwrap_or_else(|| "initialize failed".into()),
            ));
        }
        proxy.state = ProxyState::Initialized;

        let seq = proxy.send("launch", protocol::launch_args(config))?;
        let response = proxy.wait_response(seq)?;
        if !response.success {
            return Err(DriverError::AdapterHandshakeFailed(
                response.message.unwrap_or_else(|| "launch failed".into()),
            ));
        }
        proxy.state = ProxyState::Launched;

        if config.stop_on_entry {
            let stop = proxy.wait_stop(None)?;
            if stop.is_final() {
                return Err(DriverError::AdapterHandshakeFailed(format!(
                    "debuggee exited during launch (code {:?})",
                    stop.exit_code
                )));
            }
        }
        Ok(())
    }

    fn proxy_mut(&mut self) -> Result<&mut Proxy, DriverError> {
        self.proxy.as_mut().ok_or(DriverError::NotPaused)
    }

    /// Mirror one file's breakpoint list to the adapter; returns the
    /// adapter's per-breakpoint results.
    fn sync_file(&mut self, file: &Path) -> Result<Vec<Value>, DriverError> {
        let list = self
            .source_breakpoints
            .get(file)
            .cloned()
            .unwrap_or_default();
        let proxy = self.proxy.as_mut().ok_or(DriverError::NotPaused)?;
        let seq = proxy.send(
            "setBreakpoints",
            protocol::set_breakpoints_args(&file.display().to_string(), &list),
        )?;
        let response = proxy.wait_response(seq)?;
        if !response.success {
            return Err(DriverError::BackendError(
                response
                    .message
                    .unwrap_or_else(|| "setBreakpoints failed".into()),
            ));
        }
        Ok(response
            .body
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Current call stack as (adapter frame id, view) pairs. The view ids
    /// are positional: 0 is the innermost frame.
    fn stack_frames(&mut self) -> Result<Vec<(i64, FrameView)>, DriverError> {
        let proxy = self.proxy_mut()?;
        let thread_id = proxy.thread_id;
        let seq = proxy.send(
            "stackTrace",
            protocol::stack_trace_args(thread_id, 0, 64),
        )?;
        let response = proxy.wait_response(seq)?;
        if !response.success {
            return Err(DriverError::BackendError(
                response
                    .message
                    .unwrap_or_else(|| "stackTrace failed".into()),
            ));
        }

        let frames = response
            .body
            .get("stackFrames")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(frames
            .iter()
            .enumerate()
            .map(|(index, frame)| {
                let dap_id = frame.get("id").and_then(Value::as_i64).unwrap_or(0);
                let view = FrameView {
                    id: index as u32,
                    name: frame
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("<unknown>")
                        .to_string(),
                    source_path: frame
                        .pointer("/source/path")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    line: frame.get("line").and_then(Value::as_u64).unwrap_or(0) as u32,
                    column: frame.get("column").and_then(Value::as_u64).unwrap_or(0) as u32,
                };
                (dap_id, view)
            })
            .collect())
    }

    fn variables_of(&mut self, reference: i64) -> Result<Vec<VariableView>, DriverError> {
        let proxy = self.proxy_mut()?;
        let seq = proxy.send("variables", protocol::variables_args(reference))?;
        let response = proxy.wait_response(seq)?;
        if !response.success {
            return Err(DriverError::UnknownReference(reference as u32));
        }
        let list = response
            .body
            .get("variables")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(list.iter().map(variable_view).collect())
    }

    fn frame_dap_id(&mut self, frame_id: u32) -> Result<i64, DriverError> {
        let frames = self.stack_frames()?;
        frames
            .get(frame_id as usize)
            .map(|(dap_id, _)| *dap_id)
            .ok_or(DriverError::BadFrame(frame_id))
    }

    fn restart(&mut self) -> Result<StopState, DriverError> {
        let config = self
            .launch_config
            .clone()
            .ok_or_else(|| DriverError::BackendError("nothing launched yet".into()))?;
        self.shutdown_proxy(true);
        self.launch(&config)?;

        let files: Vec<_> = self.source_breakpoints.keys().cloned().collect();
        for file in files {
            self.sync_file(&file)?;
        }
        Ok(StopState::new(StopReason::Entry))
    }

    fn shutdown_proxy(&mut self, terminate_debuggee: bool) {
        let Some(mut proxy) = self.proxy.take() else {
            return;
        };
        if let Err(e) = proxy.send("disconnect", protocol::disconnect_args(terminate_debuggee)) {
            log::debug!(target: "dap", "disconnect on shutdown failed: {e}");
        }

        // give the adapter a moment to exit on its own, then make sure
        for _ in 0..10 {
            match proxy.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        if let Err(e) = proxy.child.kill() {
            log::warn!(target: "dap", "adapter kill failed: {e}");
        }
        let _ = proxy.child.wait();
    }
}

fn variable_view(value: &Value) -> VariableView {
    let named = value
        .get("namedVariables")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let indexed = value
        .get("indexedVariables")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    VariableView {
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        value: value
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        type_name: value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        variables_reference: value
            .get("variablesReference")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        children_count: (named + indexed) as u32,
    }
}

impl Driver for DapDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dap
    }

    fn launch(&mut self, config: &LaunchConfig) -> crate::driver::Result<()> {
        let (mut child, adapter_id) = self.spawn_adapter(config)?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let stdin = child.stdin.take().expect("stdin is piped");

        let mut proxy = Proxy {
            child,
            reader: FramedReader::new(TimeoutReader::new(stdout, self.settings.timeout)),
            writer: FramedWriter::new(stdin),
            seq: 0,
            thread_id: 1,
            state: ProxyState::Spawned,
            deferred: VecDeque::new(),
        };

        if let Err(e) = Self::handshake(&mut proxy, adapter_id, config) {
            if let Err(kill_err) = proxy.child.kill() {
                log::warn!(target: "dap", "adapter kill failed: {kill_err}");
            }
            let _ = proxy.child.wait();
            return Err(e);
        }

        self.proxy = Some(proxy);
        self.launch_config = Some(config.clone());
        Ok(())
    }

    fn run(&mut self, action: RunAction) -> crate::driver::Result<StopState> {
        if action == RunAction::Restart {
            return self.restart();
        }

        let proxy = self.proxy_mut()?;
        match proxy.state {
            ProxyState::Paused => {}
            // launched without stop-on-entry: the debuggee is already
            // running, a continue just waits for the first stop
            ProxyState::Launched if action == RunAction::Continue => {
                let stop = proxy.wait_stop(None)?;
                return Ok(stop);
            }
            ProxyState::Done => {
                return Err(DriverError::BackendError("debuggee already exited".into()))
            }
            _ => return Err(DriverError::NotPaused),
        }

        let command = match action {
            RunAction::Continue => "continue",
            RunAction::StepInto => "stepIn",
            RunAction::StepOver => "next",
            RunAction::StepOut => "stepOut",
            RunAction::Restart => unreachable!("handled above"),
        };
        let thread_id = proxy.thread_id;
        let seq = proxy.send(command, protocol::thread_args(thread_id))?;
        proxy.state = ProxyState::AwaitingStop;
        proxy.wait_stop(Some(seq))
    }

    fn set_breakpoint(
        &mut self,
        file: &Path,
        line: u32,
        condition: Option<&str>,
        hit_condition: Option<&str>,
    ) -> crate::driver::Result<BreakpointView> {
        let entry = self.source_breakpoints.entry(file.to_path_buf()).or_default();
        let source_bp = SourceBreakpoint {
            line,
            condition: condition.map(str::to_string),
            hit_condition: hit_condition.map(str::to_string),
        };
        let index = match entry.iter().position(|b| b.line == line) {
            Some(index) => {
                entry[index] = source_bp;
                index
            }
            None => {
                entry.push(source_bp);
                entry.len() - 1
            }
        };

        let results = self.sync_file(file)?;
        let verified = results
            .get(index)
            .and_then(|r| r.get("verified"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let actual_line = results
            .get(index)
            .and_then(|r| r.get("line"))
            .and_then(Value::as_u64)
            .map(|l| l as u32)
            .unwrap_or(line);

        let record = match self
            .records
            .iter()
            .position(|r| r.file == file && r.line == line)
        {
            Some(position) => {
                let record = &mut self.records[position];
                record.condition = condition.map(str::to_string);
                record.verified = verified;
                record.clone()
            }
            None => {
                let record = BreakpointRecord {
                    id: self.next_breakpoint_id,
                    file: file.to_path_buf(),
                    line: actual_line,
                    condition: condition.map(str::to_string),
                    verified,
                };
                self.next_breakpoint_id += 1;
                self.records.push(record.clone());
                record
            }
        };

        Ok(BreakpointView {
            id: record.id,
            file: record.file.display().to_string(),
            line: record.line,
            condition: record.condition,
            verified: record.verified,
        })
    }

    fn remove_breakpoint(&mut self, id: u32) -> crate::driver::Result<()> {
        let position = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(DriverError::UnknownBreakpoint(id))?;
        let record = self.records.remove(position);

        if let Some(list) = self.source_breakpoints.get_mut(&record.file) {
            list.retain(|b| b.line != record.line);
        }
        self.sync_file(&record.file)?;
        Ok(())
    }

    fn list_breakpoints(&self) -> Vec<BreakpointView> {
        let mut views: Vec<_> = self
            .records
            .iter()
            .map(|r| BreakpointView {
                id: r.id,
                file: r.file.display().to_string(),
                line: r.line,
                condition: r.condition.clone(),
                verified: r.verified,
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }

    fn inspect(&mut self, request: &InspectRequest) -> crate::driver::Result<InspectOutcome> {
        if self.proxy.as_ref().map(|p| p.state) != Some(ProxyState::Paused) {
            return Err(DriverError::NotPaused);
        }

        match request {
            InspectRequest::Stack => {
                let frames = self.stack_frames()?;
                Ok(InspectOutcome::Frames(
                    frames.into_iter().map(|(_, view)| view).collect(),
                ))
            }
            InspectRequest::Variable {
                variables_reference,
            } => Ok(InspectOutcome::Variables(
                self.variables_of(*variables_reference as i64)?,
            )),
            InspectRequest::Scope { scope, frame_id } => {
                let dap_frame = self.frame_dap_id(*frame_id)?;
                let proxy = self.proxy_mut()?;
                let seq = proxy.send("scopes", protocol::scopes_args(dap_frame))?;
                let response = proxy.wait_response(seq)?;
                if !response.success {
                    return Err(DriverError::BadFrame(*frame_id));
                }
                let scopes = response
                    .body
                    .get("scopes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let wanted = scope.to_string();
                let reference = scopes.iter().find_map(|s| {
                    let name = s.get("name").and_then(Value::as_str).unwrap_or("");
                    let hint = s
                        .get("presentationHint")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let matches = hint.eq_ignore_ascii_case(&wanted)
                        || name.to_ascii_lowercase().contains(wanted.trim_end_matches('s'));
                    if matches {
                        s.get("variablesReference").and_then(Value::as_i64)
                    } else {
                        None
                    }
                });

                match reference {
                    Some(reference) => {
                        Ok(InspectOutcome::Variables(self.variables_of(reference)?))
                    }
                    None => Ok(InspectOutcome::Variables(vec![])),
                }
            }
            InspectRequest::Expression {
                expression,
                frame_id,
            } => {
                let dap_frame = self.frame_dap_id(*frame_id)?;
                let proxy = self.proxy_mut()?;
                let seq = proxy.send(
                    "evaluate",
                    protocol::evaluate_args(expression, Some(dap_frame)),
                )?;
                let response = proxy.wait_response(seq)?;
                if !response.success {
                    return Err(DriverError::EvaluationFailed(
                        response
                            .message
                            .unwrap_or_else(|| format!("cannot evaluate `{expression}`")),
                    ));
                }

                let reference = response
                    .body
                    .get("variablesReference")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let named = response
                    .body
                    .get("namedVariables")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let indexed = response
                    .body
                    .get("indexedVariables")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Ok(InspectOutcome::Value(VariableView {
                    name: expression.clone(),
                    value: response
                        .body
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    type_name: response
                        .body
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    variables_reference: reference,
                    children_count: (named + indexed) as u32,
                }))
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown_proxy(true);
    }

    fn detach(&mut self) {
        self.shutdown_proxy(false);
    }
}

impl Drop for DapDriver {
    fn drop(&mut self) {
        self.shutdown_proxy(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reasons_translate_from_adapter_strings() {
        assert_eq!(stop_reason_of("breakpoint"), StopReason::Breakpoint);
        assert_eq!(stop_reason_of("function breakpoint"), StopReason::Breakpoint);
        assert_eq!(stop_reason_of("step"), StopReason::Step);
        assert_eq!(stop_reason_of("entry"), StopReason::Entry);
        assert_eq!(stop_reason_of("exception"), StopReason::Exception);
        assert_eq!(stop_reason_of("pause"), StopReason::Pause);
        assert_eq!(stop_reason_of("something else"), StopReason::Pause);
    }

    #[test]
    fn variable_view_counts_children_from_both_kinds() {
        let view = variable_view(&serde_json::json!({
            "name": "items",
            "value": "Vec(len: 3)",
            "type": "Vec<i32>",
            "variablesReference": 12,
            "indexedVariables": 3,
            "namedVariables": 1,
        }));
        assert_eq!(view.variables_reference, 12);
        assert_eq!(view.children_count, 4);
    }
}
