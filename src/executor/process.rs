//! Process-isolation mode.
//!
//! Each job gets a fresh interpreter started in isolated mode (`-I -S -B`)
//! inside a scratch directory, with a cleared environment on POSIX. The
//! request is written once on stdin; the reply is read back from a single
//! marker line on stdout. If the child outlives the deadline it is killed
//! and nothing it wrote is used.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::protocol::{self, WorkerRequest};
use super::{ExecutorError, IsolatedExecutor, IsolationMode, WorkerOutcome};
use crate::sandbox::KERNEL_SOURCE;

/// Interpreter flags: isolated mode, no `site`, no bytecode files
const INTERPRETER_FLAGS: &[&str] = &["-I", "-S", "-B"];

/// Runs the kernel in a child interpreter
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    /// Create an executor for `program`.
    ///
    /// Bare program names are looked up on `PATH` now, because the child
    /// runs with an empty environment.
    #[must_use]
    pub fn new(program: &Path, max_output_bytes: usize) -> Self {
        Self {
            program: resolve_program(program),
            max_output_bytes,
        }
    }

    /// Interpreter this executor launches
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Interpreter version string, if it runs at all
    #[must_use]
    pub fn version(&self) -> Option<String> {
        let output = Command::new(&self.program).arg("--version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        // Python 2 printed the version on stderr
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Some(String::from_utf8_lossy(&text).trim().to_string())
    }

    /// Check if the interpreter is runnable on this host
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.version().is_some_and(|v| v.starts_with("Python 3"))
    }

    fn command(&self, scratch: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(INTERPRETER_FLAGS)
            .arg("-c")
            .arg(KERNEL_SOURCE)
            .current_dir(scratch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            command.env_clear();
            command.env("LC_ALL", "C.UTF-8");
        }
        command
    }
}

impl IsolatedExecutor for ProcessExecutor {
    fn mode(&self) -> IsolationMode {
        IsolationMode::Process
    }

    fn run(&self, request: &WorkerRequest, timeout: Duration) -> Result<WorkerOutcome, ExecutorError> {
        let payload = serde_json::to_vec(request).map_err(ExecutorError::Encode)?;
        let scratch = tempfile::tempdir()?;

        let mut child = self
            .command(scratch.path())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        debug!(pid = child.id(), program = %self.program.display(), "worker started");

        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || match stdin.write_all(&payload) {
                // the child may exit before reading everything
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });
        let stdout = spawn_reader(child.stdout.take(), self.max_output_bytes);
        let stderr = spawn_reader(child.stderr.take(), self.max_output_bytes);

        let status = if let Some(status) = child.wait_timeout(timeout)? {
            status
        } else {
            warn!(pid = child.id(), ?timeout, "worker timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(WorkerOutcome::TimedOut);
        };

        if let Some(Ok(Err(e))) = writer.map(JoinHandle::join) {
            return Err(ExecutorError::Io(e));
        }
        let (stdout, stdout_truncated) = collect(stdout)?;
        let (stderr, _) = collect(stderr)?;
        debug!(%status, stdout_bytes = stdout.len(), "worker exited");

        if stdout_truncated {
            return Err(ExecutorError::NoReply(format!(
                "reply exceeded {} bytes",
                self.max_output_bytes
            )));
        }
        match protocol::extract_reply(&stdout) {
            Some(Ok(reply)) => Ok(WorkerOutcome::Completed {
                reply,
                diagnostics: stderr,
            }),
            Some(Err(e)) => Err(ExecutorError::NoReply(format!("malformed reply: {e}"))),
            None => Err(ExecutorError::NoReply(format!(
                "worker exited with {status}: {}",
                tail(&stderr, 2000)
            ))),
        }
    }
}

type Capture = JoinHandle<io::Result<(Vec<u8>, bool)>>;

/// Read at most `limit` bytes, then drain the rest so the child never blocks on a full pipe
fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>, limit: usize) -> Option<Capture> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            (&mut pipe).take(limit as u64 + 1).read_to_end(&mut buf)?;
            let truncated = buf.len() > limit;
            if truncated {
                buf.truncate(limit);
                io::copy(&mut pipe, &mut io::sink())?;
            }
            Ok((buf, truncated))
        })
    })
}

fn collect(capture: Option<Capture>) -> Result<(String, bool), ExecutorError> {
    let Some(handle) = capture else {
        return Ok((String::new(), false));
    };
    let (bytes, truncated) = handle
        .join()
        .map_err(|_| ExecutorError::NoReply("pipe reader panicked".to_string()))??;
    Ok((String::from_utf8_lossy(&bytes).into_owned(), truncated))
}

fn tail(text: &str, max_chars: usize) -> &str {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map_or(0, |(i, _)| i);
    &text[start..]
}

/// Find a bare program name on `PATH`; paths with a separator are kept as given
fn resolve_program(program: &Path) -> PathBuf {
    if program.components().count() > 1 {
        return program.to_path_buf();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| program.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraderConfig, SecurityPolicy};
    use crate::executor::protocol::{Job, ReplyStatus, ResourceLimits, Stage, SymbolKind};
    use crate::sandbox::build_sandbox_environment;
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn executor() -> Option<ProcessExecutor> {
        let config = GraderConfig::default();
        let executor = ProcessExecutor::new(&config.python_bin, config.max_output_bytes);
        if executor.is_available() {
            Some(executor)
        } else {
            eprintln!("Skipping test: Python not available");
            None
        }
    }

    fn request(source: &str) -> WorkerRequest {
        WorkerRequest {
            job: Job::Execute,
            source: source.to_string(),
            environment: build_sandbox_environment(&SecurityPolicy::default(), "\n", BTreeMap::new())
                .unwrap(),
            limits: Some(ResourceLimits {
                memory_bytes: Some(256 * 1024 * 1024),
                cpu_secs: Some(5),
                file_size_bytes: Some(1024 * 1024),
            }),
            deadline_secs: None,
            max_capture_chars: 64 * 1024,
            tests: None,
        }
    }

    fn completed(outcome: WorkerOutcome) -> crate::executor::WorkerReply {
        match outcome {
            WorkerOutcome::Completed { reply, .. } => reply,
            WorkerOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_definitions_are_exposed() {
        let Some(executor) = executor() else { return };
        let outcome = executor
            .run(&request("def f():\n    return 42\n\nprint('ready')\n"), Duration::from_secs(10))
            .unwrap();
        let reply = completed(outcome);
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.stdout, "ready\n");
        assert_eq!(reply.symbols.len(), 1);
        assert_eq!(reply.symbols[0].name, "f");
        assert_eq!(reply.symbols[0].kind, SymbolKind::Function);
    }

    #[test]
    fn test_runtime_error_message_is_verbatim() {
        let Some(executor) = executor() else { return };
        let reply = completed(executor.run(&request("x = 1 / 0\n"), Duration::from_secs(10)).unwrap());
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert_eq!(reply.stage, Some(Stage::Runtime));
        assert_eq!(reply.error.as_deref(), Some("division by zero"));
        assert!(reply.stderr.contains("ZeroDivisionError"));
    }

    #[test]
    fn test_runtime_guard_blocks_dynamic_attribute() {
        let Some(executor) = executor() else { return };
        let source = "name = '__' + 'class' + '__'\nx = getattr(1, name)\n";
        let reply = completed(executor.run(&request(source), Duration::from_secs(10)).unwrap());
        assert_eq!(reply.stage, Some(Stage::Guard));
        assert!(reply.error.unwrap().contains("__class__"));
    }

    #[test]
    fn test_unlisted_builtin_is_absent() {
        let Some(executor) = executor() else { return };
        let reply = completed(executor.run(&request("vars()\n"), Duration::from_secs(10)).unwrap());
        assert_eq!(reply.stage, Some(Stage::Runtime));
        assert!(reply.error.unwrap().contains("vars"));
    }

    #[test]
    fn test_busy_loop_is_killed() {
        let Some(executor) = executor() else { return };
        let start = Instant::now();
        let outcome = executor
            .run(&request("while True:\n    pass\n"), Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_missing_interpreter_is_a_spawn_error() {
        let executor = ProcessExecutor::new(Path::new("/nonexistent/python3"), 1024);
        assert!(!executor.is_available());
        let err = executor
            .run(&request("x = 1"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("  abcdef  ", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        assert_eq!(
            resolve_program(Path::new("/usr/bin/python3")),
            PathBuf::from("/usr/bin/python3")
        );
    }
}
