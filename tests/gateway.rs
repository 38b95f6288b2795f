//! End-to-end gateway scenarios against a scripted in-process driver.
//!
//! These cover the JSON-RPC surface: tool routing, parameter validation,
//! session lifecycle and reply shapes, without spawning real backends.

use cog_debug::driver::{
    BreakpointView, Driver, DriverError, DriverKind, InspectOutcome, InspectRequest, LaunchConfig,
    RunAction, StopReason, StopState, VariableView,
};
use cog_debug::rpc::dispatcher::{Dispatcher, DriverFactory};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// A driver that replays a fixed stop sequence and records breakpoints.
struct ScriptedDriver {
    kind: DriverKind,
    breakpoints: Vec<BreakpointView>,
    next_id: u32,
    stops: VecDeque<StopState>,
}

impl ScriptedDriver {
    fn new(kind: DriverKind, stops: Vec<StopState>) -> Self {
        Self {
            kind,
            breakpoints: vec![],
            next_id: 1,
            stops: stops.into(),
        }
    }
}

impl Driver for ScriptedDriver {
    fn kind(&self) -> DriverKind {
        self.kind
    }

    fn launch(&mut self, _: &LaunchConfig) -> cog_debug::driver::Result<()> {
        Ok(())
    }

    fn run(&mut self, action: RunAction) -> cog_debug::driver::Result<StopState> {
        if action == RunAction::Restart {
            return Ok(StopState::new(StopReason::Entry));
        }
        Ok(self.stops.pop_front().unwrap_or(StopState::exited(0)))
    }

    fn set_breakpoint(
        &mut self,
        file: &Path,
        line: u32,
        condition: Option<&str>,
        _: Option<&str>,
    ) -> cog_debug::driver::Result<BreakpointView> {
        let view = BreakpointView {
            id: self.next_id,
            file: file.display().to_string(),
            line,
            condition: condition.map(str::to_string),
            verified: true,
        };
        self.next_id += 1;
        self.breakpoints.push(view.clone());
        Ok(view)
    }

    fn remove_breakpoint(&mut self, id: u32) -> cog_debug::driver::Result<()> {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|b| b.id != id);
        if self.breakpoints.len() == before {
            return Err(DriverError::UnknownBreakpoint(id));
        }
        Ok(())
    }

    fn list_breakpoints(&self) -> Vec<BreakpointView> {
        self.breakpoints.clone()
    }

    fn inspect(&mut self, request: &InspectRequest) -> cog_debug::driver::Result<InspectOutcome> {
        match request {
            InspectRequest::Scope { .. } => Ok(InspectOutcome::Variables(vec![
                VariableView::scalar("x", "42", "int"),
                VariableView::scalar("y", "43", "int"),
            ])),
            InspectRequest::Expression { expression, .. } => Ok(InspectOutcome::Value(
                VariableView::scalar(expression.clone(), "42", "int"),
            )),
            InspectRequest::Variable {
                variables_reference,
            } => Err(DriverError::UnknownReference(*variables_reference)),
            InspectRequest::Stack => Ok(InspectOutcome::Frames(vec![])),
        }
    }

    fn stop(&mut self) {}
}

/// Factory producing one scripted run: breakpoint hit, then clean exit.
struct ScriptedFactory;

impl DriverFactory for ScriptedFactory {
    fn create(
        &self,
        kind: DriverKind,
        _: &LaunchConfig,
    ) -> cog_debug::driver::Result<Box<dyn Driver>> {
        Ok(Box::new(ScriptedDriver::new(
            kind,
            vec![
                StopState::new(StopReason::Breakpoint),
                StopState::exited(0),
            ],
        )))
    }
}

/// A driver whose backend dies on the first resume.
struct DyingDriver;

impl Driver for DyingDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Dwarf
    }
    fn launch(&mut self, _: &LaunchConfig) -> cog_debug::driver::Result<()> {
        Ok(())
    }
    fn run(&mut self, _: RunAction) -> cog_debug::driver::Result<StopState> {
        Err(DriverError::BackendError("adapter pipe closed".into()))
    }
    fn set_breakpoint(
        &mut self,
        _: &Path,
        _: u32,
        _: Option<&str>,
        _: Option<&str>,
    ) -> cog_debug::driver::Result<BreakpointView> {
        Err(DriverError::NotPaused)
    }
    fn remove_breakpoint(&mut self, _: u32) -> cog_debug::driver::Result<()> {
        Ok(())
    }
    fn list_breakpoints(&self) -> Vec<BreakpointView> {
        vec![]
    }
    fn inspect(&mut self, _: &InspectRequest) -> cog_debug::driver::Result<InspectOutcome> {
        Err(DriverError::NotPaused)
    }
    fn stop(&mut self) {}
}

struct DyingFactory;

impl DriverFactory for DyingFactory {
    fn create(
        &self,
        _: DriverKind,
        _: &LaunchConfig,
    ) -> cog_debug::driver::Result<Box<dyn Driver>> {
        Ok(Box::new(DyingDriver))
    }
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Box::new(ScriptedFactory), PathBuf::from("/p"))
}

fn call(dispatcher: &mut Dispatcher, id: u64, method: &str, params: Value) -> Value {
    let line = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let reply = dispatcher
        .handle_line(&line.to_string())
        .expect("requests get replies");
    serde_json::from_str(&reply).unwrap()
}

fn call_tool(dispatcher: &mut Dispatcher, id: u64, tool: &str, arguments: Value) -> Value {
    call(
        dispatcher,
        id,
        "tools/call",
        json!({"name": tool, "arguments": arguments}),
    )
}

#[test]
fn python_breakpoint_scenario() {
    let mut gw = dispatcher();

    let reply = call_tool(
        &mut gw,
        1,
        "debug_launch",
        json!({"program": "fixtures/simple.py", "stop_on_entry": true}),
    );
    assert_eq!(reply["result"]["session_id"], "session-1");
    assert_eq!(reply["result"]["status"], "stopped");

    let reply = call_tool(
        &mut gw,
        2,
        "debug_breakpoint",
        json!({
            "session_id": "session-1", "action": "set",
            "file": "fixtures/simple.py", "line": 4
        }),
    );
    let bp = &reply["result"]["breakpoints"][0];
    assert_eq!(bp["id"], 1);
    assert_eq!(bp["verified"], true);
    assert_eq!(bp["line"], 4);

    let reply = call_tool(
        &mut gw,
        3,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    assert_eq!(reply["result"]["stop_reason"], "breakpoint");
    assert_eq!(reply["result"]["status"], "stopped");

    let reply = call_tool(
        &mut gw,
        4,
        "debug_inspect",
        json!({"session_id": "session-1", "scope": "locals"}),
    );
    let variables = reply["result"]["variables"].as_array().unwrap();
    assert!(variables
        .iter()
        .any(|v| v["name"] == "x" && v["value"] == "42"));

    let reply = call_tool(&mut gw, 5, "debug_stop", json!({"session_id": "session-1"}));
    assert_eq!(reply["result"]["stopped"], true);

    // the session is gone after stop
    let reply = call_tool(
        &mut gw,
        6,
        "debug_breakpoint",
        json!({"session_id": "session-1", "action": "list"}),
    );
    assert_eq!(reply["error"]["code"], -32602);
}

#[test]
fn unknown_tool_is_method_not_found() {
    let mut gw = dispatcher();
    let reply = call_tool(&mut gw, 1, "nope", json!({}));
    assert_eq!(reply["error"]["code"], -32601);
}

#[test]
fn missing_program_is_invalid_params_naming_the_field() {
    let mut gw = dispatcher();
    let reply = call_tool(&mut gw, 1, "debug_launch", json!({}));
    assert_eq!(reply["error"]["code"], -32602);
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("program"));
}

#[test]
fn set_then_list_shows_the_same_breakpoint() {
    let mut gw = dispatcher();
    call_tool(&mut gw, 1, "debug_launch", json!({"program": "app"}));

    let set = call_tool(
        &mut gw,
        2,
        "debug_breakpoint",
        json!({
            "session_id": "session-1", "action": "set",
            "file": "src/app.c", "line": 17
        }),
    );
    let set_bp = set["result"]["breakpoints"][0].clone();

    let list = call_tool(
        &mut gw,
        3,
        "debug_breakpoint",
        json!({"session_id": "session-1", "action": "list"}),
    );
    let listed = list["result"]["breakpoints"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["file"], set_bp["file"]);
    assert_eq!(listed[0]["line"], set_bp["line"]);

    let removed = call_tool(
        &mut gw,
        4,
        "debug_breakpoint",
        json!({"session_id": "session-1", "action": "remove", "id": set_bp["id"]}),
    );
    assert_eq!(removed["result"]["removed"], true);

    let list = call_tool(
        &mut gw,
        5,
        "debug_breakpoint",
        json!({"session_id": "session-1", "action": "list"}),
    );
    assert!(list["result"]["breakpoints"].as_array().unwrap().is_empty());
}

#[test]
fn run_to_exit_reports_code_and_destroys_the_session() {
    let mut gw = dispatcher();
    call_tool(&mut gw, 1, "debug_launch", json!({"program": "app"}));

    // first run: breakpoint; second run: exit
    call_tool(
        &mut gw,
        2,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    let reply = call_tool(
        &mut gw,
        3,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    assert_eq!(reply["result"]["stop_reason"], "exit");
    assert_eq!(reply["result"]["exit_code"], 0);
    assert_eq!(reply["result"]["status"], "terminated");

    let reply = call_tool(
        &mut gw,
        4,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    assert_eq!(reply["error"]["code"], -32602);
}

#[test]
fn fatal_backend_error_destroys_the_session() {
    let mut gw = Dispatcher::new(Box::new(DyingFactory), PathBuf::from("/p"));
    let reply = call_tool(&mut gw, 1, "debug_launch", json!({"program": "app"}));
    assert_eq!(reply["result"]["session_id"], "session-1");

    let reply = call_tool(
        &mut gw,
        2,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    assert_eq!(reply["error"]["code"], -32603);
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("adapter pipe closed"));

    // the dead backend took its session with it; nothing leaks in the table
    let reply = call_tool(
        &mut gw,
        3,
        "debug_run",
        json!({"session_id": "session-1", "action": "continue"}),
    );
    assert_eq!(reply["error"]["code"], -32602);
    assert!(reply["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unknown session"));
}

#[test]
fn session_ids_are_never_reused() {
    let mut gw = dispatcher();
    let first = call_tool(&mut gw, 1, "debug_launch", json!({"program": "a"}));
    assert_eq!(first["result"]["session_id"], "session-1");

    call_tool(&mut gw, 2, "debug_stop", json!({"session_id": "session-1"}));

    let second = call_tool(&mut gw, 3, "debug_launch", json!({"program": "b"}));
    assert_eq!(second["result"]["session_id"], "session-2");
}

#[test]
fn unknown_run_action_is_invalid_params() {
    let mut gw = dispatcher();
    call_tool(&mut gw, 1, "debug_launch", json!({"program": "app"}));
    let reply = call_tool(
        &mut gw,
        2,
        "debug_run",
        json!({"session_id": "session-1", "action": "warp"}),
    );
    assert_eq!(reply["error"]["code"], -32602);
    assert!(reply["error"]["message"].as_str().unwrap().contains("warp"));
}

#[test]
fn tools_list_carries_schemas_verbatim() {
    let mut gw = dispatcher();
    let reply = call(&mut gw, 1, "tools/list", json!({}));
    let tools = reply["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 5);

    let launch = tools.iter().find(|t| t["name"] == "debug_launch").unwrap();
    assert_eq!(launch["inputSchema"]["required"][0], "program");

    let run = tools.iter().find(|t| t["name"] == "debug_run").unwrap();
    let actions = run["inputSchema"]["properties"]["action"]["enum"]
        .as_array()
        .unwrap();
    assert_eq!(actions.len(), 5);
}

#[test]
fn initialize_advertises_the_server() {
    let mut gw = dispatcher();
    let reply = call(&mut gw, 1, "initialize", json!({}));
    assert_eq!(reply["result"]["serverInfo"]["name"], "cog-debug");
    assert!(reply["result"]["capabilities"]["tools"].is_object());
}

#[test]
fn expression_inspect_returns_a_value() {
    let mut gw = dispatcher();
    call_tool(&mut gw, 1, "debug_launch", json!({"program": "app"}));
    let reply = call_tool(
        &mut gw,
        2,
        "debug_inspect",
        json!({"session_id": "session-1", "expression": "x"}),
    );
    assert_eq!(reply["result"]["value"], "42");
    assert_eq!(reply["result"]["type"], "int");
}
