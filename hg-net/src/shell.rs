use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

/// Default timeout for a single privileged subprocess invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs a single privileged command and reports back `(stdout, stderr, code)`.
/// Never raises on a non-zero exit — callers decide what a given exit code
/// means (the add-then-change idiom in [`crate::TrafficShaper`] relies on
/// this).
#[async_trait]
pub trait ShellExecutor: Send + Sync {
    async fn run(&self, argv: &[&str]) -> CommandOutput {
        self.run_timeout(argv, DEFAULT_TIMEOUT).await
    }

    async fn run_timeout(&self, argv: &[&str], timeout: Duration) -> CommandOutput;
}

/// Invokes `argv[0]` as a real subprocess via `tokio::process::Command`.
pub struct RealShell;

impl RealShell {
    pub fn new() -> Self {
        RealShell
    }
}

impl Default for RealShell {
    fn default() -> Self {
        RealShell::new()
    }
}

#[async_trait]
impl ShellExecutor for RealShell {
    async fn run_timeout(&self, argv: &[&str], timeout: Duration) -> CommandOutput {
        debug!("exec: {}", argv.join(" "));
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput {
                stdout: String::new(),
                stderr: "empty argv".to_string(),
                code: -1,
            };
        };
        let fut = tokio::process::Command::new(program).args(args).output();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(output)) => CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                code: output.status.code().unwrap_or(-1),
            },
            Ok(Err(e)) => CommandOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                code: -1,
            },
            Err(_) => CommandOutput {
                stdout: String::new(),
                stderr: format!("timed out after {:?}", timeout),
                code: -1,
            },
        }
    }
}

/// Test double: records every argv it is asked to run, and returns canned
/// responses queued per-program (`argv[0]`), falling back to a default
/// success response when no response was queued.
pub struct FakeShell {
    calls: Mutex<Vec<Vec<String>>>,
    responses: Mutex<std::collections::HashMap<String, VecDeque<CommandOutput>>>,
}

impl Default for FakeShell {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeShell {
    pub fn new() -> Self {
        FakeShell {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Queue a response to be returned the next time `program` is invoked.
    pub fn queue_response(&self, program: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|argv| argv.first().map(|s| s.as_str()) == Some(program))
            .collect()
    }
}

#[async_trait]
impl ShellExecutor for FakeShell {
    async fn run_timeout(&self, argv: &[&str], _timeout: Duration) -> CommandOutput {
        self.calls
            .lock()
            .unwrap()
            .push(argv.iter().map(|s| s.to_string()).collect());
        let program = argv.first().copied().unwrap_or_default();
        if let Some(queue) = self.responses.lock().unwrap().get_mut(program) {
            if let Some(output) = queue.pop_front() {
                return output;
            }
        }
        CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            code: 0,
        }
    }
}
