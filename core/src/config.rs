//! Configuration loading and validation for supervised processes
//!
//! This module parses a TOML file describing a set of processes to run under
//! one supervisor, applies defaults, and performs strict validation with
//! field-path error messages.
//!
//! ```toml
//! [supervisor]
//! wait_timeout_secs = 30
//!
//! [[process]]
//! name = "greeter"
//! program = "/bin/echo"
//! args = ["hello"]
//!
//! [[process]]
//! name = "pipeline"
//! command = "sort | uniq -c"
//! stdin = "b\na\nb\n"
//! ```

use crate::child::Target;
use crate::options::ProcessOptions;
use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level TOML structure
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorFile {
    /// Supervisor-wide settings
    #[serde(default)]
    pub supervisor: SupervisorSection,
    /// Processes to spawn, in order
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessEntry>,
}

/// `[supervisor]` table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    /// Upper bound for waiting on all children; absent means wait forever
    pub wait_timeout_secs: Option<u64>,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: Option<String>,
}

impl SupervisorSection {
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

/// One `[[process]]` entry
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProcessEntry {
    /// Label used in logs and output prefixes
    pub name: String,
    /// Program to execute directly (exclusive with `command`)
    pub program: Option<String>,
    /// Arguments for `program`
    #[serde(default)]
    pub args: Vec<String>,
    /// Shell command line (exclusive with `program`)
    pub command: Option<String>,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub clear_environment: bool,
    /// Shell used for `command`; defaults to /bin/sh
    pub shell: Option<PathBuf>,
    #[serde(default)]
    pub new_process_group: bool,
    #[serde(default)]
    pub merge_stderr: bool,
    /// Signal name such as "SIGTERM" or "SIGINT"
    pub terminate_signal: Option<String>,
    /// Escalate to SIGKILL this many milliseconds after a terminate request
    pub kill_after_ms: Option<u64>,
    /// Text written to stdin, which is then closed
    pub stdin: Option<String>,
}

impl ProcessEntry {
    /// What this entry executes
    pub fn target(&self) -> Result<Target> {
        match (&self.program, &self.command) {
            (Some(program), None) => Ok(Target::Program {
                executable: program.clone(),
                args: self.args.clone(),
            }),
            (None, Some(command)) => Ok(Target::Shell {
                command_line: command.clone(),
            }),
            _ => Err(CoreError::ValidationError(format!(
                "process '{}': exactly one of program or command must be set",
                self.name
            ))),
        }
    }

    /// Convert into spawn options
    pub fn to_options(&self) -> Result<ProcessOptions> {
        let mut options = ProcessOptions::default()
            .with_clear_environment(self.clear_environment)
            .with_new_process_group(self.new_process_group)
            .with_merge_stderr(self.merge_stderr);

        if let Some(dir) = &self.working_directory {
            options = options.with_working_directory(dir);
        }
        for (key, value) in &self.environment {
            options = options.with_env(key, value);
        }
        if let Some(shell) = &self.shell {
            options = options.with_shell(shell);
        }
        if let Some(name) = &self.terminate_signal {
            options = options.with_terminate_signal(parse_signal(name)?);
        }
        if let Some(ms) = self.kill_after_ms {
            options = options.with_kill_after(Duration::from_millis(ms));
        }
        Ok(options)
    }
}

/// Parse a signal name, accepting both "SIGTERM" and "TERM"
pub fn parse_signal(name: &str) -> Result<Signal> {
    let trimmed = name.trim().to_ascii_uppercase();
    let full = if trimmed.starts_with("SIG") {
        trimmed
    } else {
        format!("SIG{}", trimmed)
    };
    Signal::from_str(&full)
        .map_err(|_| CoreError::ValidationError(format!("unknown signal '{}'", name)))
}

impl SupervisorFile {
    /// Validate the configuration and return `Result<()>` with field-path errors
    pub fn validate(&self) -> Result<()> {
        if self.processes.is_empty() {
            return Err(CoreError::ValidationError(
                "process: must contain at least one process".to_string(),
            ));
        }

        if let Some(0) = self.supervisor.wait_timeout_secs {
            return Err(CoreError::ValidationError(
                "supervisor.wait_timeout_secs: must be > 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, entry) in self.processes.iter().enumerate() {
            if entry.name.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "process[{}].name: cannot be empty",
                    i
                )));
            }
            if !seen.insert(entry.name.clone()) {
                return Err(CoreError::ValidationError(format!(
                    "process[{}].name: duplicate name '{}'",
                    i, entry.name
                )));
            }

            match (&entry.program, &entry.command) {
                (Some(_), Some(_)) => {
                    return Err(CoreError::ValidationError(format!(
                        "process[{}]: program and command are mutually exclusive",
                        i
                    )));
                }
                (None, None) => {
                    return Err(CoreError::ValidationError(format!(
                        "process[{}]: one of program or command is required",
                        i
                    )));
                }
                (Some(program), None) if program.trim().is_empty() => {
                    return Err(CoreError::ValidationError(format!(
                        "process[{}].program: cannot be empty",
                        i
                    )));
                }
                (None, Some(command)) if command.trim().is_empty() => {
                    return Err(CoreError::ValidationError(format!(
                        "process[{}].command: cannot be empty",
                        i
                    )));
                }
                _ => {}
            }

            if entry.command.is_some() && !entry.args.is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "process[{}].args: only valid with program",
                    i
                )));
            }

            for key in entry.environment.keys() {
                if key.trim().is_empty() || key.contains('=') {
                    return Err(CoreError::ValidationError(format!(
                        "process[{}].environment: invalid key '{}'",
                        i, key
                    )));
                }
            }

            if let Some(signal) = &entry.terminate_signal {
                parse_signal(signal).map_err(|_| {
                    CoreError::ValidationError(format!(
                        "process[{}].terminate_signal: unknown signal '{}'",
                        i, signal
                    ))
                })?;
            }

            if let Some(0) = entry.kill_after_ms {
                return Err(CoreError::ValidationError(format!(
                    "process[{}].kill_after_ms: must be > 0",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a supervisor file from a TOML path
pub fn load_from_toml_path(path: impl AsRef<Path>) -> Result<SupervisorFile> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_from_toml_str(&data)
}

/// Load and validate a supervisor file from a TOML string
pub fn load_from_toml_str(input: &str) -> Result<SupervisorFile> {
    let file: SupervisorFile = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    file.validate()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_minimal() {
        let file = load_from_toml_str(
            r#"
            [[process]]
            name = "echo"
            program = "/bin/echo"
            args = ["hello"]
            "#,
        )
        .unwrap();

        assert_eq!(file.processes.len(), 1);
        assert_eq!(file.supervisor.wait_timeout(), None);
        assert_eq!(
            file.processes[0].target().unwrap(),
            Target::Program {
                executable: "/bin/echo".to_string(),
                args: vec!["hello".to_string()],
            }
        );
    }

    #[test]
    fn test_load_full_entry() {
        let file = load_from_toml_str(
            r#"
            [supervisor]
            wait_timeout_secs = 30
            log_level = "debug"

            [[process]]
            name = "worker"
            command = "sort | uniq -c"
            working_directory = "/tmp"
            environment = { FOO = "bar" }
            new_process_group = true
            merge_stderr = true
            terminate_signal = "INT"
            kill_after_ms = 1500
            stdin = "b\na\nb\n"
            "#,
        )
        .unwrap();

        assert_eq!(file.supervisor.wait_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(file.supervisor.log_level.as_deref(), Some("debug"));

        let entry = &file.processes[0];
        let options = entry.to_options().unwrap();
        assert_eq!(options.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(options.environment.get("FOO").map(String::as_str), Some("bar"));
        assert!(options.new_process_group);
        assert!(options.merge_stderr);
        assert_eq!(options.terminate_signal, Signal::SIGINT);
        assert_eq!(options.kill_after, Some(Duration::from_millis(1500)));
        assert_eq!(entry.stdin.as_deref(), Some("b\na\nb\n"));
        assert!(matches!(entry.target().unwrap(), Target::Shell { .. }));
    }

    #[test]
    fn test_validation_errors_carry_field_paths() {
        let cases = [
            ("", "process: must contain at least one process"),
            (
                "[[process]]\nname = \" \"\nprogram = \"true\"",
                "process[0].name: cannot be empty",
            ),
            (
                "[[process]]\nname = \"a\"\nprogram = \"true\"\n[[process]]\nname = \"a\"\nprogram = \"true\"",
                "process[1].name: duplicate name 'a'",
            ),
            (
                "[[process]]\nname = \"a\"\nprogram = \"true\"\ncommand = \"true\"",
                "process[0]: program and command are mutually exclusive",
            ),
            (
                "[[process]]\nname = \"a\"",
                "process[0]: one of program or command is required",
            ),
            (
                "[[process]]\nname = \"a\"\ncommand = \"echo\"\nargs = [\"x\"]",
                "process[0].args: only valid with program",
            ),
            (
                "[[process]]\nname = \"a\"\nprogram = \"true\"\nterminate_signal = \"SIGNOPE\"",
                "process[0].terminate_signal: unknown signal 'SIGNOPE'",
            ),
            (
                "[[process]]\nname = \"a\"\nprogram = \"true\"\nkill_after_ms = 0",
                "process[0].kill_after_ms: must be > 0",
            ),
            (
                "[supervisor]\nwait_timeout_secs = 0\n[[process]]\nname = \"a\"\nprogram = \"true\"",
                "supervisor.wait_timeout_secs: must be > 0",
            ),
        ];

        for (input, expected) in cases {
            match load_from_toml_str(input) {
                Err(CoreError::ValidationError(msg)) => assert_eq!(msg, expected, "input: {}", input),
                other => panic!("Expected validation error for {:?}, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        let result = load_from_toml_str("[[process]]\nname = \"a\"\nprogram = \"true\"\nbogus = 1");
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal(" hup ").unwrap(), Signal::SIGHUP);
        assert!(parse_signal("nope").is_err());
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[process]]\nname = \"t\"\nprogram = \"true\"").unwrap();

        let loaded = load_from_toml_path(file.path()).unwrap();
        assert_eq!(loaded.processes[0].name, "t");

        let missing = load_from_toml_path("/nonexistent/warden.toml");
        assert!(matches!(missing, Err(CoreError::ConfigurationError(_))));
    }
}
