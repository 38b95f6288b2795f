//! The static tool catalog.
//!
//! Input schemas are authored as opaque JSON documents and spliced into the
//! `tools/list` reply as raw text. They are never round-tripped through a
//! JSON model, so field order stays exactly as written here. Schemas are
//! single-line because replies travel over a line-delimited transport.

use serde::Serialize;
use serde_json::value::RawValue;

pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: &'static str,
}

pub static TOOLS: [ToolDescriptor; 5] = [
    ToolDescriptor {
        name: "debug_launch",
        description: "Launch a program under a debugger and create a debug session. \
                      Picks a DAP adapter or the native DWARF engine from the language \
                      hint or the program's file extension.",
        input_schema: r#"{"type":"object","properties":{"program":{"type":"string","description":"Path to the program to debug"},"args":{"type":"array","items":{"type":"string"},"description":"Command line arguments"},"env":{"type":"object","additionalProperties":{"type":"string"},"description":"Extra environment variables"},"cwd":{"type":"string","description":"Working directory for the debuggee"},"language":{"type":"string","description":"Language hint (python, go, javascript, native, ...)"},"stop_on_entry":{"type":"boolean","default":false,"description":"Pause at the program entry point"}},"required":["program"]}"#,
    },
    ToolDescriptor {
        name: "debug_breakpoint",
        description: "Set, remove or list breakpoints of a debug session.",
        input_schema: r#"{"type":"object","properties":{"session_id":{"type":"string"},"action":{"type":"string","enum":["set","remove","list"]},"file":{"type":"string","description":"Source file (required for set)"},"line":{"type":"integer","minimum":1,"description":"1-indexed line (required for set)"},"condition":{"type":"string","description":"Only stop when this condition holds"},"hit_condition":{"type":"string","description":"Only stop on matching hit counts, e.g. \">3\""},"id":{"type":"integer","description":"Breakpoint id (required for remove)"}},"required":["session_id","action"]}"#,
    },
    ToolDescriptor {
        name: "debug_run",
        description: "Resume execution and wait for the next stop. Returns the stop \
                      reason and, on exit, the debuggee's exit code.",
        input_schema: r#"{"type":"object","properties":{"session_id":{"type":"string"},"action":{"type":"string","enum":["continue","step_into","step_over","step_out","restart"]}},"required":["session_id","action"]}"#,
    },
    ToolDescriptor {
        name: "debug_inspect",
        description: "Inspect the paused debuggee: evaluate an expression, expand a \
                      structured variable, enumerate a scope, or (with no selector) \
                      report the call stack.",
        input_schema: r#"{"type":"object","properties":{"session_id":{"type":"string"},"expression":{"type":"string","description":"One-shot expression to evaluate"},"variable_ref":{"type":"integer","description":"Handle from a previous inspect to expand"},"frame_id":{"type":"integer","default":0,"description":"Stack frame, 0 = innermost"},"scope":{"type":"string","enum":["locals","globals","arguments"]}},"required":["session_id"]}"#,
    },
    ToolDescriptor {
        name: "debug_stop",
        description: "Forcibly terminate the debuggee and destroy the session.",
        input_schema: r#"{"type":"object","properties":{"session_id":{"type":"string"}},"required":["session_id"]}"#,
    },
];

#[derive(Serialize)]
struct ToolEntry<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(rename = "inputSchema")]
    input_schema: &'a RawValue,
}

#[derive(Serialize)]
struct Catalog<'a> {
    tools: Vec<ToolEntry<'a>>,
}

/// Build the `tools/list` result. Schemas are spliced verbatim: the
/// catalog is serialized straight to text, never into a JSON model that
/// would reorder the authored documents.
pub fn catalog() -> Box<RawValue> {
    let catalog = Catalog {
        tools: TOOLS
            .iter()
            .map(|tool| ToolEntry {
                name: tool.name,
                description: tool.description,
                input_schema: serde_json::from_str::<&RawValue>(tool.input_schema)
                    .expect("tool schemas are valid JSON"),
            })
            .collect(),
    };
    let text = serde_json::to_string(&catalog).expect("catalog serialization is infallible");
    RawValue::from_string(text).expect("catalog is valid JSON")
}

pub fn find(name: &str) -> Option<&'static ToolDescriptor> {
    TOOLS.iter().find(|tool| tool.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_all_five_tools() {
        let catalog = catalog();
        let parsed: serde_json::Value = serde_json::from_str(catalog.get()).unwrap();
        let names: Vec<_> = parsed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "debug_launch",
                "debug_breakpoint",
                "debug_run",
                "debug_inspect",
                "debug_stop"
            ]
        );
    }

    #[test]
    fn schemas_are_spliced_byte_for_byte() {
        let raw = catalog().get().to_string();
        for tool in &TOOLS {
            assert!(
                raw.contains(tool.input_schema),
                "{} schema was re-serialized",
                tool.name
            );
        }
    }

    #[test]
    fn catalog_serializes_to_a_single_line() {
        assert!(!catalog().get().contains('\n'));
    }

    #[test]
    fn every_schema_declares_its_required_fields() {
        for tool in &TOOLS {
            let schema: serde_json::Value = serde_json::from_str(tool.input_schema).unwrap();
            let required = schema["required"].as_array().unwrap();
            assert!(!required.is_empty(), "{} has no required fields", tool.name);
            if tool.name != "debug_launch" {
                assert_eq!(required[0], "session_id");
            }
        }
    }
}
