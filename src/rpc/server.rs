//! The stdio server loop: one JSON-RPC message per line in, one reply per
//! line out. Stdout carries exclusively JSON-RPC.

use crate::rpc::dispatcher::Dispatcher;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Serve until EOF or a termination signal. Returns the process exit code.
pub fn serve(dispatcher: &mut Dispatcher) -> anyhow::Result<i32> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    let code = run_loop(dispatcher, &mut reader, &mut writer, &shutdown);

    // destroy every session in creation order; each driver's stop runs
    dispatcher.shutdown();
    code
}

fn run_loop(
    dispatcher: &mut Dispatcher,
    reader: &mut impl BufRead,
    writer: &mut impl Write,
    shutdown: &AtomicBool,
) -> anyhow::Result<i32> {
    let mut line = String::new();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!(target: "gateway", "termination signal received, shutting down");
            return Ok(0);
        }

        dispatcher.reap_orphans();

        line.clear();
        let read = match reader.read_line(&mut line) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!(target: "gateway", "stdin read failed: {e}");
                return Ok(1);
            }
        };
        if read == 0 {
            log::info!(target: "gateway", "agent closed stdin, shutting down");
            return Ok(0);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(reply) = dispatcher.handle_line(trimmed) {
            let written = writeln!(writer, "{reply}").and_then(|()| writer.flush());
            if let Err(e) = written {
                // a write failure on a shutting-down stdout is benign
                if shutdown.load(Ordering::Relaxed) {
                    log::debug!(target: "gateway", "stdout write during shutdown: {e}");
                    return Ok(0);
                }
                log::error!(target: "gateway", "stdout write failed: {e}");
                return Ok(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::*;
    use crate::rpc::dispatcher::DriverFactory;
    use std::path::{Path, PathBuf};

    struct NeverLaunch;

    impl DriverFactory for NeverLaunch {
        fn create(
            &self,
            _: DriverKind,
            config: &LaunchConfig,
        ) -> crate::driver::Result<Box<dyn Driver>> {
            Err(DriverError::UnsupportedLanguage(
                config.program.display().to_string(),
            ))
        }
    }

    struct StubDriver;

    impl Driver for StubDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::Dwarf
        }
        fn launch(&mut self, _: &LaunchConfig) -> crate::driver::Result<()> {
            Ok(())
        }
        fn run(&mut self, _: RunAction) -> crate::driver::Result<StopState> {
            Ok(StopState::new(StopReason::Step))
        }
        fn set_breakpoint(
            &mut self,
            file: &Path,
            line: u32,
            _: Option<&str>,
            _: Option<&str>,
        ) -> crate::driver::Result<BreakpointView> {
            Ok(BreakpointView {
                id: 1,
                file: file.display().to_string(),
                line,
                condition: None,
                verified: true,
            })
        }
        fn remove_breakpoint(&mut self, _: u32) -> crate::driver::Result<()> {
            Ok(())
        }
        fn list_breakpoints(&self) -> Vec<BreakpointView> {
            vec![]
        }
        fn inspect(&mut self, _: &InspectRequest) -> crate::driver::Result<InspectOutcome> {
            Ok(InspectOutcome::Variables(vec![]))
        }
        fn stop(&mut self) {}
    }

    struct StubFactory;

    impl DriverFactory for StubFactory {
        fn create(
            &self,
            _: DriverKind,
            _: &LaunchConfig,
        ) -> crate::driver::Result<Box<dyn Driver>> {
            Ok(Box::new(StubDriver))
        }
    }

    fn serve_lines(factory: Box<dyn DriverFactory>, input: &str) -> (Vec<String>, i32) {
        let mut dispatcher = Dispatcher::new(factory, PathBuf::from("/p"));
        let mut reader = std::io::BufReader::new(input.as_bytes());
        let mut out = Vec::new();
        let shutdown = AtomicBool::new(false);
        let code = run_loop(&mut dispatcher, &mut reader, &mut out, &shutdown).unwrap();
        let text = String::from_utf8(out).unwrap();
        let replies = text.lines().map(str::to_string).collect();
        (replies, code)
    }

    #[test]
    fn replies_in_request_order_then_exits_cleanly_on_eof() {
        let input = "\
            {\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n\
            {\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n";
        let (replies, code) = serve_lines(Box::new(StubFactory), input);
        assert_eq!(code, 0);
        assert_eq!(replies.len(), 2);
        assert!(replies[0].contains("\"id\":1"));
        assert!(replies[1].contains("\"id\":2"));
        assert!(replies[1].contains("debug_launch"));
    }

    #[test]
    fn malformed_json_gets_parse_error_and_serving_continues() {
        let input = "{oops\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n";
        let (replies, _) = serve_lines(Box::new(StubFactory), input);
        assert_eq!(replies.len(), 2);
        assert!(replies[0].contains("-32700"));
        assert!(replies[1].contains("\"id\":7"));
    }

    #[test]
    fn blank_lines_and_notifications_produce_no_reply() {
        let input = "\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n";
        let (replies, code) = serve_lines(Box::new(StubFactory), input);
        assert_eq!(code, 0);
        assert!(replies.is_empty());
    }

    #[test]
    fn failed_launch_is_an_internal_error() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\
                     \"params\":{\"name\":\"debug_launch\",\"arguments\":{\"program\":\"x\"}}}\n";
        let (replies, _) = serve_lines(Box::new(NeverLaunch), input);
        assert!(replies[0].contains("-32603"));
        assert!(replies[0].contains("unsupported language"));
    }
}
