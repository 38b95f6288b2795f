//! Language → debug adapter dispatch.

use crate::driver::{DriverError, LaunchConfig};
use std::path::Path;

/// How to start an adapter subprocess for a given language.
#[derive(Debug, Clone)]
pub struct AdapterCommand {
    pub program: String,
    pub args: Vec<String>,
    /// `adapterID` reported in the initialize request.
    pub adapter_id: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Go,
    JavaScript,
    Java,
}

/// Language of a launch request: the hint wins, then the file extension.
pub fn language_of(config: &LaunchConfig) -> Option<Language> {
    if let Some(hint) = config.language.as_deref() {
        return match hint.to_ascii_lowercase().as_str() {
            "python" | "py" => Some(Language::Python),
            "go" | "golang" => Some(Language::Go),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "java" => Some(Language::Java),
            _ => None,
        };
    }
    match config.program.extension().and_then(|e| e.to_str()) {
        Some("py") => Some(Language::Python),
        Some("go") => Some(Language::Go),
        Some("js") => Some(Language::JavaScript),
        Some("java") => Some(Language::Java),
        _ => None,
    }
}

/// Resolve the adapter command line for a launch request.
pub fn resolve(config: &LaunchConfig) -> Result<AdapterCommand, DriverError> {
    let language = language_of(config).ok_or_else(|| {
        DriverError::UnsupportedLanguage(describe_program(&config.program))
    })?;

    match language {
        Language::Python => {
            let python = which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| {
                    DriverError::UnsupportedLanguage(
                        "python: no python3 interpreter on PATH".into(),
                    )
                })?;
            Ok(AdapterCommand {
                program: python.display().to_string(),
                args: vec!["-m".into(), "debugpy.adapter".into()],
                adapter_id: "debugpy",
            })
        }
        Language::Go => {
            let dlv = which::which("dlv").map_err(|_| {
                DriverError::UnsupportedLanguage("go: dlv not found on PATH".into())
            })?;
            Ok(AdapterCommand {
                program: dlv.display().to_string(),
                args: vec!["dap".into()],
                adapter_id: "go",
            })
        }
        Language::JavaScript => {
            // the node inspector bridge; only available when the user
            // installed the js-debug adapter CLI
            let adapter = which::which("js-debug-adapter").map_err(|_| {
                DriverError::UnsupportedLanguage(
                    "javascript: js-debug-adapter not found on PATH".into(),
                )
            })?;
            Ok(AdapterCommand {
                program: adapter.display().to_string(),
                args: vec![],
                adapter_id: "pwa-node",
            })
        }
        Language::Java => Err(DriverError::UnsupportedLanguage(
            "java: no debug adapter bundled".into(),
        )),
    }
}

fn describe_program(program: &Path) -> String {
    format!("no adapter for {}", program.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(program: &str, language: Option<&str>) -> LaunchConfig {
        let mut config = LaunchConfig::new(program);
        config.language = language.map(str::to_string);
        config
    }

    #[test]
    fn extension_maps_to_language() {
        assert_eq!(
            language_of(&config("/p/app.py", None)),
            Some(Language::Python)
        );
        assert_eq!(language_of(&config("/p/main.go", None)), Some(Language::Go));
        assert_eq!(
            language_of(&config("/p/index.js", None)),
            Some(Language::JavaScript)
        );
        assert_eq!(
            language_of(&config("/p/Main.java", None)),
            Some(Language::Java)
        );
        assert_eq!(language_of(&config("/p/simple", None)), None);
    }

    #[test]
    fn hint_wins_over_extension() {
        assert_eq!(
            language_of(&config("/p/tool", Some("python"))),
            Some(Language::Python)
        );
        assert_eq!(language_of(&config("/p/app.py", Some("rust"))), None);
    }

    #[test]
    fn java_is_refused_with_a_named_gap() {
        let err = resolve(&config("/p/Main.java", None)).unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedLanguage(m) if m.contains("java")));
    }
}
