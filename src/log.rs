//! Logging bootstrap. Stdout belongs to the JSON-RPC transport, so every
//! log line goes to stderr.

use std::io::Write;

/// Install the global logger. Level comes from `RUST_LOG` (default `info`).
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
