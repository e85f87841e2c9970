//! External command execution
//!
//! Every external tool the engine touches goes through a [`CommandRunner`].
//! The contract is small: run an argv synchronously, hand back the exit
//! code, stdout lines and stderr text.
//!
//! # Implementations
//!
//! | Runner            | Use |
//! |-------------------|-----|
//! | `SystemRunner`    | Real execution, own process group, optional soft time cap |
//! | `DryRunRunner`    | Logs and records argv, always succeeds |
//! | `RecordingRunner` | Records argv, scripted responses and failures (tests) |

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::process_guard::{CommandProcessGroup, terminate_group};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout` lines.
    pub fn ok(stdout: Vec<String>) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `ExternalToolFailed` with the diagnostic text.
    pub fn ensure_success(self, argv: &[String]) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let diagnostic = if self.stderr.trim().is_empty() {
            self.stdout.join("\n")
        } else {
            self.stderr.trim().to_string()
        };
        Err(StorageError::ExternalToolFailed {
            command: argv.join(" "),
            exit_code: self.exit_code,
            diagnostic,
        })
    }
}

/// Runs external tools for the engine.
pub trait CommandRunner {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput>;

    /// Commands are only recorded, never executed.
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Argv of every command seen, for runners that record them.
    fn history(&self) -> &[Vec<String>] {
        &[]
    }
}

/// Build an argv from string slices.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|p| p.as_ref().to_string()).collect()
}

// ============================================================================
// System runner
// ============================================================================

/// Executes commands on the host, each in its own process group.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    soft_cap: Option<Duration>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop waiting after `cap`; a command that wrote nothing to stderr by
    /// then counts as successful.
    pub fn with_soft_cap(cap: Duration) -> Self {
        Self { soft_cap: Some(cap) }
    }

    fn spawn_failure(argv: &[String], e: std::io::Error) -> StorageError {
        StorageError::ExternalToolFailed {
            command: argv.join(" "),
            exit_code: 127,
            diagnostic: e.to_string(),
        }
    }
}

type Drain = Option<JoinHandle<std::io::Result<Vec<u8>>>>;

/// Read a pipe to its end on its own thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Drain {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(reader: Drain) -> Result<Vec<u8>> {
    match reader {
        Some(handle) => match handle.join() {
            Ok(bytes) => Ok(bytes?),
            Err(_) => Err(StorageError::invalid("output reader thread panicked")),
        },
        None => Ok(Vec::new()),
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes).lines().map(str::to_string).collect()
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(StorageError::invalid("empty command line"));
        };
        debug!(command = %argv.join(" "), "Running external command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| Self::spawn_failure(argv, e))?;

        let Some(cap) = self.soft_cap else {
            let output = child.wait_with_output()?;
            return Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: split_lines(&output.stdout),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        };

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let start = Instant::now();
        let mut expired = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if start.elapsed() >= cap {
                expired = true;
                terminate_group(child.id(), Duration::from_millis(500));
                break child.try_wait()?;
            }
            std::thread::sleep(Duration::from_millis(20));
        };
        let _ = child.wait();

        let stdout = collect(stdout_reader)?;
        let stderr = collect(stderr_reader)?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exit_code = if expired {
            if stderr.trim().is_empty() {
                warn!(command = %argv.join(" "), "Command exceeded soft time cap without errors");
                0
            } else {
                warn!(command = %argv.join(" "), "Command exceeded soft time cap");
                -1
            }
        } else {
            status.and_then(|s| s.code()).unwrap_or(-1)
        };

        Ok(CommandOutput {
            exit_code,
            stdout: split_lines(&stdout),
            stderr,
        })
    }
}

// ============================================================================
// Dry-run and recording runners
// ============================================================================

/// Logs and records commands without running them.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    commands: Vec<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput> {
        info!(command = %argv.join(" "), "[dry-run] would run");
        self.commands.push(argv.to_vec());
        Ok(CommandOutput::ok(Vec::new()))
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    fn history(&self) -> &[Vec<String>] {
        &self.commands
    }
}

#[derive(Debug, Clone)]
struct Script {
    prefix: Vec<String>,
    output: CommandOutput,
}

/// Records commands and answers them from a script keyed by argv prefix.
///
/// Unscripted commands succeed with empty output. The first matching
/// script entry wins.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    commands: Vec<Vec<String>>,
    scripts: Vec<Script>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands starting with `prefix` exit with `exit_code` and `stderr`.
    pub fn fail_on(mut self, prefix: &[&str], exit_code: i32, stderr: &str) -> Self {
        self.scripts.push(Script {
            prefix: argv(prefix),
            output: CommandOutput {
                exit_code,
                stdout: Vec::new(),
                stderr: stderr.to_string(),
            },
        });
        self
    }

    /// Commands starting with `prefix` succeed printing `stdout`.
    pub fn respond(mut self, prefix: &[&str], stdout: &[&str]) -> Self {
        self.scripts.push(Script {
            prefix: argv(prefix),
            output: CommandOutput::ok(argv(stdout)),
        });
        self
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput> {
        self.commands.push(argv.to_vec());
        let scripted = self
            .scripts
            .iter()
            .find(|s| argv.starts_with(&s.prefix))
            .map(|s| s.output.clone());
        Ok(scripted.unwrap_or_default())
    }

    fn history(&self) -> &[Vec<String>] {
        &self.commands
    }
}
