//! DAP message building and classification.
//!
//! Outgoing requests are JSON objects with `seq`, `type:"request"`,
//! `command` and `arguments`. Incoming bodies fall into three shapes:
//! responses (matched back by `request_seq`), events (named by `event`) and
//! everything else (logged and ignored).

use crate::driver::LaunchConfig;
use serde::Deserialize;
use serde_json::{json, Value};

/// Build a request envelope.
pub fn request(seq: i64, command: &str, arguments: Value) -> Value {
    json!({
        "seq": seq,
        "type": "request",
        "command": command,
        "arguments": arguments,
    })
}

/// `initialize` arguments: 1-indexed lines and columns, no run-in-terminal.
pub fn initialize_args(adapter_id: &str) -> Value {
    json!({
        "clientID": "cog-debug",
        "clientName": "cog-debug",
        "adapterID": adapter_id,
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsRunInTerminalRequest": false,
        "locale": "en-US",
    })
}

pub fn launch_args(config: &LaunchConfig) -> Value {
    let mut args = json!({
        "program": config.program.display().to_string(),
        "args": config.args,
        "stopOnEntry": config.stop_on_entry,
    });
    if let Some(cwd) = &config.cwd {
        args["cwd"] = json!(cwd.display().to_string());
    }
    if !config.env.is_empty() {
        args["env"] = json!(config.env);
    }
    args
}

/// Replace-all breakpoint list for one source file.
pub fn set_breakpoints_args(path: &str, breakpoints: &[SourceBreakpoint]) -> Value {
    json!({
        "source": { "path": path },
        "breakpoints": breakpoints
            .iter()
            .map(|bp| {
                let mut entry = json!({ "line": bp.line });
                if let Some(condition) = &bp.condition {
                    entry["condition"] = json!(condition);
                }
                if let Some(hit) = &bp.hit_condition {
                    entry["hitCondition"] = json!(hit);
                }
                entry
            })
            .collect::<Vec<_>>(),
    })
}

pub fn thread_args(thread_id: i64) -> Value {
    json!({ "threadId": thread_id })
}

pub fn stack_trace_args(thread_id: i64, start_frame: u32, levels: u32) -> Value {
    json!({
        "threadId": thread_id,
        "startFrame": start_frame,
        "levels": levels,
    })
}

pub fn scopes_args(frame_id: i64) -> Value {
    json!({ "frameId": frame_id })
}

pub fn variables_args(variables_reference: i64) -> Value {
    json!({ "variablesReference": variables_reference })
}

pub fn evaluate_args(expression: &str, frame_id: Option<i64>) -> Value {
    let mut args = json!({
        "expression": expression,
        "context": "repl",
    });
    if let Some(frame_id) = frame_id {
        args["frameId"] = json!(frame_id);
    }
    args
}

pub fn disconnect_args(terminate_debuggee: bool) -> Value {
    json!({ "terminateDebuggee": terminate_debuggee })
}

/// One entry of a replace-all `setBreakpoints` request.
#[derive(Debug, Clone)]
pub struct SourceBreakpoint {
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

/// Response envelope.
#[derive(Debug, Deserialize)]
pub struct DapResponse {
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// Event envelope.
#[derive(Debug, Deserialize)]
pub struct DapEvent {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

/// An incoming body, classified.
#[derive(Debug)]
pub enum Message {
    Response(DapResponse),
    Event(DapEvent),
    Unknown(Value),
}

pub fn classify(value: Value) -> Message {
    match value.get("type").and_then(Value::as_str) {
        Some("response") => match serde_json::from_value(value.clone()) {
            Ok(response) => Message::Response(response),
            Err(_) => Message::Unknown(value),
        },
        Some("event") => match serde_json::from_value(value.clone()) {
            Ok(event) => Message::Event(event),
            Err(_) => Message::Unknown(value),
        },
        _ => Message::Unknown(value),
    }
}

/// Typed view of the events the proxy cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Stopped {
        reason: String,
        thread_id: Option<i64>,
    },
    Exited {
        exit_code: i32,
    },
    Terminated,
    Initialized,
    Output {
        category: String,
        output: String,
    },
    Continued,
    Thread,
    Other(String),
}

impl DapEvent {
    pub fn parse(&self) -> Event {
        match self.event.as_str() {
            "stopped" => Event::Stopped {
                reason: self
                    .body
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                thread_id: self.body.get("threadId").and_then(Value::as_i64),
            },
            "exited" => Event::Exited {
                exit_code: self
                    .body
                    .get("exitCode")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as i32,
            },
            "terminated" => Event::Terminated,
            "initialized" => Event::Initialized,
            "output" => Event::Output {
                category: self
                    .body
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or("console")
                    .to_string(),
                output: self
                    .body
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            },
            "continued" => Event::Continued,
            "thread" => Event::Thread,
            other => Event::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_seq_command_and_arguments() {
        let args = json!({"program": "/p/app.py", "stopOnEntry": true});
        let encoded = request(7, "launch", args.clone());
        let decoded: Value = serde_json::from_slice(&serde_json::to_vec(&encoded).unwrap()).unwrap();
        assert_eq!(decoded["seq"], 7);
        assert_eq!(decoded["type"], "request");
        assert_eq!(decoded["command"], "launch");
        assert_eq!(decoded["arguments"], args);
    }

    #[test]
    fn initialize_arguments_identify_the_client() {
        let args = initialize_args("debugpy");
        assert_eq!(args["clientID"], "cog-debug");
        assert_eq!(args["linesStartAt1"], true);
        assert_eq!(args["columnsStartAt1"], true);
        assert_eq!(args["supportsRunInTerminalRequest"], false);
    }

    #[test]
    fn set_breakpoints_replaces_the_whole_file_list() {
        let bps = vec![
            SourceBreakpoint {
                line: 4,
                condition: None,
                hit_condition: None,
            },
            SourceBreakpoint {
                line: 9,
                condition: Some("x > 1".into()),
                hit_condition: None,
            },
        ];
        let args = set_breakpoints_args("/p/app.py", &bps);
        assert_eq!(args["source"]["path"], "/p/app.py");
        assert_eq!(args["breakpoints"].as_array().unwrap().len(), 2);
        assert_eq!(args["breakpoints"][1]["condition"], "x > 1");
        assert!(args["breakpoints"][0].get("condition").is_none());
    }

    #[test]
    fn classify_splits_responses_events_and_noise() {
        let response = json!({
            "type": "response", "seq": 3, "request_seq": 2,
            "success": true, "command": "initialize"
        });
        assert!(matches!(classify(response), Message::Response(r) if r.request_seq == 2));

        let event = json!({
            "type": "event", "event": "stopped",
            "body": {"reason": "breakpoint", "threadId": 4}
        });
        match classify(event) {
            Message::Event(e) => assert_eq!(
                e.parse(),
                Event::Stopped {
                    reason: "breakpoint".into(),
                    thread_id: Some(4)
                }
            ),
            other => panic!("expected event, got {other:?}"),
        }

        assert!(matches!(
            classify(json!({"type": "gibberish"})),
            Message::Unknown(_)
        ));
    }

    #[test]
    fn exited_event_carries_the_exit_code() {
        let event = DapEvent {
            event: "exited".into(),
            body: json!({"exitCode": 3}),
        };
        assert_eq!(event.parse(), Event::Exited { exit_code: 3 });
    }
}
