//! cog-debug: an agent-facing debugging gateway.
//!
//! An MCP-style JSON-RPC 2.0 tool server on stdio that multiplexes debug
//! sessions over two backends: a DAP proxy driving language adapters and a
//! native DWARF engine driving compiled binaries through ptrace. Every
//! debuggee runs inside an OS-level sandbox.

pub mod config;
pub mod dap;
pub mod driver;
pub mod log;
pub mod native;
pub mod rpc;
pub mod sandbox;
pub mod session;
