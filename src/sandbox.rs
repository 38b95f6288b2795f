//! OS-level sandbox profiles for spawned debuggees and debug adapters.
//!
//! Every child the gateway launches is confined to the project tree plus a
//! small explicit allow-list:
//!
//! - **Linux**: Landlock path rules (kernel 5.13+), applied after fork and
//!   before exec.
//! - **macOS**: `sandbox-exec` with a Scheme DSL profile (deprecated but
//!   functional).
//! - **Other**: no confinement; the gap is logged and the launch proceeds.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Access grade attached to a single path rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessGrade {
    ReadOnly,
    ReadWrite,
    Execute,
}

/// A filesystem rule: everything beneath `path` gets `grade` access.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub path: PathBuf,
    pub grade: AccessGrade,
}

/// System trees a debuggee may execute from. Interpreters and shared
/// libraries live here on every supported distro.
const EXEC_TREES: [&str; 5] = ["/usr", "/bin", "/sbin", "/lib", "/lib64"];

/// Sandbox policy for one debug session.
///
/// The project directory is readable, `/tmp` and the allow-list are
/// writable, system trees are executable, network is loopback-only.
/// Home directory writes are never granted.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Project root. Readable, not writable.
    project_dir: PathBuf,
    /// Extra paths granted read+write (e.g. a scratch dir the agent owns).
    write_allowlist: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            write_allowlist: Vec::new(),
        }
    }

    #[must_use]
    pub fn allow_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.write_allowlist.push(path.into());
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// True when the policy lets a child read `path`.
    ///
    /// Also used by the engine to refuse breakpoint requests on sources
    /// outside the sandbox.
    pub fn is_read_allowed(&self, path: &Path) -> bool {
        path.starts_with(&self.project_dir)
            || path.starts_with("/tmp")
            || EXEC_TREES.iter().any(|t| path.starts_with(t))
            || self.write_allowlist.iter().any(|p| path.starts_with(p))
    }

    /// True when the policy lets a child write `path`. Only `/tmp` and the
    /// explicit allow-list qualify.
    pub fn is_write_allowed(&self, path: &Path) -> bool {
        path.starts_with("/tmp") || self.write_allowlist.iter().any(|p| path.starts_with(p))
    }

    /// Path rules for Landlock enforcement.
    pub fn rules(&self) -> Vec<PathRule> {
        let mut rules = vec![PathRule {
            path: self.project_dir.clone(),
            grade: AccessGrade::ReadOnly,
        }];
        for tree in EXEC_TREES {
            let path = PathBuf::from(tree);
            if path.exists() {
                rules.push(PathRule {
                    path,
                    grade: AccessGrade::Execute,
                });
            }
        }
        rules.push(PathRule {
            path: PathBuf::from("/tmp"),
            grade: AccessGrade::ReadWrite,
        });
        for path in &self.write_allowlist {
            rules.push(PathRule {
                path: path.clone(),
                grade: AccessGrade::ReadWrite,
            });
        }
        rules
    }

    /// Generate the macOS `sandbox-exec` Scheme profile.
    ///
    /// Default-deny; reads for the project and system trees; writes only
    /// for `/tmp` and the allow-list; network restricted to localhost.
    pub fn macos_profile(&self) -> String {
        let mut profile = String::new();
        profile.push_str("(version 1)\n");
        profile.push_str("(deny default)\n\n");

        let _ = writeln!(
            profile,
            "(allow file-read* (subpath \"{}\"))",
            self.project_dir.display()
        );
        for tree in EXEC_TREES
            .iter()
            .copied()
            .chain(["/System", "/Library", "/private/tmp", "/tmp"])
        {
            let _ = writeln!(profile, "(allow file-read* (subpath \"{tree}\"))");
        }

        let _ = writeln!(profile, "(allow file-write* (subpath \"/tmp\"))");
        let _ = writeln!(profile, "(allow file-write* (subpath \"/private/tmp\"))");
        for path in &self.write_allowlist {
            let _ = writeln!(
                profile,
                "(allow file-write* (subpath \"{}\"))",
                path.display()
            );
        }

        profile.push_str("(allow process-exec)\n");
        profile.push_str("(allow process-fork)\n");
        profile.push_str("(allow sysctl-read)\n");

        profile.push_str("(allow network-outbound (local ip \"localhost:*\"))\n");
        profile.push_str("(allow network-outbound (remote ip \"localhost:*\"))\n");
        profile.push_str("(allow network-inbound (local ip \"localhost:*\"))\n");

        profile
    }

    /// Wrap a command line with sandbox enforcement where the platform
    /// needs an outer launcher. On macOS the profile is written to a file
    /// under `/tmp` and the command becomes `sandbox-exec -f <profile> ...`;
    /// on Linux enforcement happens in [`SandboxPolicy::apply`] instead and
    /// the command is returned unchanged.
    pub fn wrap_command(
        &self,
        program: &str,
        args: &[String],
    ) -> std::io::Result<(String, Vec<String>)> {
        if cfg!(target_os = "macos") {
            let profile_path =
                std::env::temp_dir().join(format!("cog-sandbox-{}.sb", std::process::id()));
            std::fs::write(&profile_path, self.macos_profile())?;

            let mut wrapped = vec![
                "-f".to_string(),
                profile_path.to_string_lossy().into_owned(),
                program.to_string(),
            ];
            wrapped.extend(args.iter().cloned());
            Ok(("sandbox-exec".to_string(), wrapped))
        } else {
            if !cfg!(target_os = "linux") {
                log::warn!(
                    target: "gateway",
                    "no OS sandbox available on this platform, debuggee runs unconfined"
                );
            }
            Ok((program.to_string(), args.to_vec()))
        }
    }

    /// Apply Landlock restrictions to the calling process. Invoked in the
    /// child between fork and exec.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> Result<(), landlock::RulesetError> {
        use landlock::{
            Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr, ABI,
        };

        let abi = ABI::V2;
        let mut ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(abi))?
            .create()?;

        for rule in self.rules() {
            let fd = match PathFd::new(&rule.path) {
                Ok(fd) => fd,
                // missing allow-list entries are not fatal
                Err(_) => continue,
            };
            let access = match rule.grade {
                AccessGrade::ReadOnly => AccessFs::ReadFile | AccessFs::ReadDir,
                AccessGrade::Execute => AccessFs::Execute | AccessFs::ReadFile | AccessFs::ReadDir,
                AccessGrade::ReadWrite => AccessFs::from_all(abi),
            };
            ruleset = ruleset.add_rule(PathBeneath::new(fd, access))?;
        }

        ruleset.restrict_self()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_denies_by_default_and_pins_network_to_localhost() {
        let profile = SandboxPolicy::new("/p").macos_profile();
        assert!(profile.contains("(deny default)"));
        assert!(profile.contains("localhost"));
        assert!(!profile.contains("*:*"));
        assert!(!profile.contains("/home"));
    }

    #[test]
    fn profile_never_grants_home_writes() {
        let policy = SandboxPolicy::new("/p").allow_write("/tmp/cog-scratch");
        let profile = policy.macos_profile();
        for line in profile.lines().filter(|l| l.contains("file-write")) {
            assert!(line.contains("/tmp"), "unexpected write grant: {line}");
        }
    }

    #[test]
    fn read_predicate_covers_project_and_system_trees() {
        let policy = SandboxPolicy::new("/p");
        assert!(policy.is_read_allowed(Path::new("/p/src/main.c")));
        assert!(policy.is_read_allowed(Path::new("/usr/lib/libc.so.6")));
        assert!(policy.is_read_allowed(Path::new("/tmp/scratch")));
        assert!(!policy.is_read_allowed(Path::new("/etc/shadow")));
        assert!(!policy.is_read_allowed(Path::new("/home/user/.ssh/id_rsa")));
    }

    #[test]
    fn write_predicate_is_tmp_and_allowlist_only() {
        let policy = SandboxPolicy::new("/p").allow_write("/var/cog");
        assert!(policy.is_write_allowed(Path::new("/tmp/out.log")));
        assert!(policy.is_write_allowed(Path::new("/var/cog/db")));
        assert!(!policy.is_write_allowed(Path::new("/p/src/main.c")));
        assert!(!policy.is_write_allowed(Path::new("/home/user/notes")));
    }

    #[test]
    fn rules_carry_the_three_grades() {
        let policy = SandboxPolicy::new("/p").allow_write("/tmp/extra");
        let rules = policy.rules();

        let project = rules.iter().find(|r| r.path == Path::new("/p")).unwrap();
        assert_eq!(project.grade, AccessGrade::ReadOnly);

        let tmp = rules.iter().find(|r| r.path == Path::new("/tmp")).unwrap();
        assert_eq!(tmp.grade, AccessGrade::ReadWrite);

        assert!(rules
            .iter()
            .filter(|r| r.grade == AccessGrade::Execute)
            .all(|r| EXEC_TREES.contains(&r.path.to_str().unwrap())));
    }
}
