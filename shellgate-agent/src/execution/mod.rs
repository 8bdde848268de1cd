//! Command execution engine for Shellgate agents
//!
//! Handles execution of resolved command definitions:
//! - Platform resolution (exact platform, then the `all` fallback)
//! - Shell command execution with deadline and process-group kill, also
//!   when the caller drops the execution before it finishes
//! - Ordered step sequences (shell / delay) that abort on first failure
//! - Last-line literal blacklist (defense-in-depth, not a security boundary)
//!
//! A command that exits non-zero is a normal report (`success = false`);
//! only deadline expiry, unsupported platforms and blacklist hits surface
//! as `ExecutionError`.

use parking_lot::Mutex;
use shellgate_shared::command::ALL_PLATFORMS;
use shellgate_shared::{CommandDefinition, CommandStep, ErrorKind, ExecutionResult, PlatformCommand};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Literal patterns refused before anything is spawned
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -fr /",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "dd if=/dev/random of=/dev/",
    "> /dev/sda",
    "chmod -r 777 /",
    "format c:",
    "del /f /s /q c:\\",
];

/// How long to wait for pipe readers once the process is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("command timed out after {elapsed_ms}ms")]
    Timeout {
        output: String,
        elapsed_ms: u64,
        failed_step: Option<usize>,
    },
    #[error("no command defined for platform {platform}")]
    PlatformUnsupported { platform: String },
    #[error("command rejected by safety filter")]
    Rejected { pattern: String },
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::PlatformUnsupported { .. } => ErrorKind::PlatformUnsupported,
            ExecutionError::Rejected { .. } => ErrorKind::Rejected,
        }
    }
}

/// Host platform name as used in command definitions
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

/// Cross-platform command executor
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    platform: String,
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_platform(current_platform())
    }

    pub fn with_platform(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Look up the platform entry, falling back to `all`
    pub fn resolve<'a>(
        def: &'a CommandDefinition,
        platform: &str,
    ) -> Result<&'a PlatformCommand, ExecutionError> {
        let alias = match platform {
            "macos" => Some("darwin"),
            "darwin" => Some("macos"),
            _ => None,
        };

        def.platforms
            .get(platform)
            .or_else(|| alias.and_then(|a| def.platforms.get(a)))
            .or_else(|| def.platforms.get(ALL_PLATFORMS))
            .ok_or_else(|| ExecutionError::PlatformUnsupported {
                platform: platform.to_string(),
            })
    }

    /// Refuse known-destructive literals
    pub fn validate_command(command: &str) -> Result<(), ExecutionError> {
        let normalized = command
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        for pattern in BLOCKED_PATTERNS {
            if matches_pattern(&normalized, pattern) {
                warn!("Blocked command matching pattern {:?}", pattern);
                return Err(ExecutionError::Rejected {
                    pattern: pattern.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve, validate every shell string, then run
    pub async fn run(
        &self,
        def: &CommandDefinition,
        deadline: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let resolved = Self::resolve(def, &self.platform)?;
        for command in resolved.shell_commands() {
            Self::validate_command(command)?;
        }

        info!("Running command {} on {} (deadline: {}ms)", def.id, self.platform, deadline.as_millis());
        match resolved {
            PlatformCommand::Single(command) => self.execute(command, deadline).await,
            PlatformCommand::Sequence(steps) => self.execute_sequence(steps, deadline).await,
        }
    }

    /// Execute shell command with deadline
    pub async fn execute(&self, command: &str, deadline: Duration) -> Result<ExecutionResult, ExecutionError> {
        let start_time = Instant::now();
        debug!("Executing shell command: {} (deadline: {}ms)", command, deadline.as_millis());

        let mut child = match shell_command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(format!("Failed to execute command: {}", e)),
                    exit_code: -1,
                    duration_ms: elapsed_ms(start_time),
                    failed_step: None,
                });
            }
        };

        let mut group = ProcessGroupGuard::new(child.id());

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            spawn_reader(child.stdout.take(), stdout_buf.clone()),
            spawn_reader(child.stderr.take(), stderr_buf.clone()),
        ];

        let waited = tokio::time::timeout(deadline, child.wait()).await;
        group.disarm();
        match waited {
            Ok(Ok(status)) => {
                drain(readers).await;
                let exit_code = status.code().unwrap_or(-1);
                Ok(ExecutionResult {
                    success: exit_code == 0,
                    output: combine(&stdout_buf.lock(), &stderr_buf.lock()),
                    error: None,
                    exit_code,
                    duration_ms: elapsed_ms(start_time),
                    failed_step: None,
                })
            }
            Ok(Err(e)) => {
                drain(readers).await;
                Ok(ExecutionResult {
                    success: false,
                    output: combine(&stdout_buf.lock(), &stderr_buf.lock()),
                    error: Some(format!("Failed to wait for command: {}", e)),
                    exit_code: -1,
                    duration_ms: elapsed_ms(start_time),
                    failed_step: None,
                })
            }
            Err(_) => {
                warn!("Command exceeded {}ms deadline, killing: {}", deadline.as_millis(), command);
                terminate(&mut child).await;
                drain(readers).await;
                Err(ExecutionError::Timeout {
                    output: combine(&stdout_buf.lock(), &stderr_buf.lock()),
                    elapsed_ms: elapsed_ms(start_time),
                    failed_step: None,
                })
            }
        }
    }

    /// Run steps in order; the first non-success step aborts the sequence
    pub async fn execute_sequence(
        &self,
        steps: &[CommandStep],
        deadline: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let start_time = Instant::now();
        let deadline_at = start_time + deadline;
        let mut log = String::new();
        let mut exit_code = 0;

        for (idx, step) in steps.iter().enumerate() {
            let number = idx + 1;
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            debug!("Sequence step {}/{} ({})", number, steps.len(), step.kind());

            match step {
                CommandStep::Shell { command } => {
                    log.push_str(&format!("[step {}] {}\n", number, command));
                    match self.execute(command, remaining).await {
                        Ok(result) => {
                            log.push_str(&result.output);
                            exit_code = result.exit_code;
                            if !result.success {
                                let detail = result
                                    .error
                                    .unwrap_or_else(|| format!("exit code {}", result.exit_code));
                                return Ok(step_failure(log, number, step, detail, exit_code, start_time));
                            }
                        }
                        Err(ExecutionError::Timeout { output, .. }) => {
                            log.push_str(&output);
                            return Err(ExecutionError::Timeout {
                                output: log,
                                elapsed_ms: elapsed_ms(start_time),
                                failed_step: Some(number),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
                CommandStep::Delay { duration_ms } => {
                    let wanted = Duration::from_millis(*duration_ms);
                    if wanted > remaining {
                        tokio::time::sleep(remaining).await;
                        return Err(ExecutionError::Timeout {
                            output: log,
                            elapsed_ms: elapsed_ms(start_time),
                            failed_step: Some(number),
                        });
                    }
                    tokio::time::sleep(wanted).await;
                }
                CommandStep::Unsupported => {
                    let detail = "unsupported step type".to_string();
                    return Ok(step_failure(log, number, step, detail, -1, start_time));
                }
            }
        }

        Ok(ExecutionResult {
            success: true,
            output: log,
            error: None,
            exit_code,
            duration_ms: elapsed_ms(start_time),
            failed_step: None,
        })
    }
}

fn step_failure(
    output: String,
    number: usize,
    step: &CommandStep,
    detail: String,
    exit_code: i32,
    start_time: Instant,
) -> ExecutionResult {
    info!("Sequence aborted at step {}: {}", number, detail);
    ExecutionResult {
        success: false,
        output,
        error: Some(format!("step {} ({}) failed: {}", number, step.kind(), detail)),
        exit_code,
        duration_ms: elapsed_ms(start_time),
        failed_step: Some(number),
    }
}

fn matches_pattern(command: &str, pattern: &str) -> bool {
    // "rm -rf /" must not match "rm -rf /tmp/build"
    let needs_boundary = pattern.ends_with(" /");
    command.match_indices(pattern).any(|(pos, _)| {
        if !needs_boundary {
            return true;
        }
        match command[pos + pattern.len()..].chars().next() {
            None => true,
            Some(c) => matches!(c, ' ' | ';' | '&' | '|' | '*'),
        }
    })
}

fn shell_command(command: &str) -> AsyncCommand {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    // own process group so a timeout takes the whole tree down
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut cmd = AsyncCommand::from(cmd);
    cmd.kill_on_drop(true);
    cmd
}

fn spawn_reader<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Background children may keep a pipe open; don't wait on them forever
async fn drain(readers: [JoinHandle<()>; 2]) {
    for mut reader in readers {
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

/// Kills the command's process group when `execute` is dropped before the
/// shell is reaped (client gone, outer timeout). `kill_on_drop` alone only
/// reaches the shell, not what it started.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// Once the wait is over the caller owns cleanup; a reaped group id may be reused
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            warn!("Execution abandoned, killing process group {}", pgid);
            kill_group(pgid);
        }
    }
}

fn kill_group(pgid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pgid, e);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        kill_group(pid);
    }

    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
    // reap so nothing is left behind
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed command: {}", e);
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}\nSTDERR:\n{}", stdout, stderr)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn definition(platforms: Vec<(&str, PlatformCommand)>) -> CommandDefinition {
        CommandDefinition {
            id: "test".into(),
            name: None,
            description: String::new(),
            category: None,
            homepage: false,
            platforms: platforms
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<HashMap<_, _>>(),
            timeout_ms: 5000,
            security: Default::default(),
        }
    }

    fn shell(command: &str) -> CommandStep {
        CommandStep::Shell {
            command: command.to_string(),
        }
    }

    #[test]
    fn test_resolve_prefers_platform_then_all() {
        let def = definition(vec![
            ("linux", PlatformCommand::Single("uptime".into())),
            ("all", PlatformCommand::Single("echo fallback".into())),
        ]);

        let linux = ExecutionEngine::resolve(&def, "linux").unwrap();
        assert_eq!(linux, &PlatformCommand::Single("uptime".into()));

        let windows = ExecutionEngine::resolve(&def, "windows").unwrap();
        assert_eq!(windows, &PlatformCommand::Single("echo fallback".into()));
    }

    #[test]
    fn test_resolve_darwin_alias_and_unsupported() {
        let def = definition(vec![("darwin", PlatformCommand::Single("sw_vers".into()))]);
        assert!(ExecutionEngine::resolve(&def, "macos").is_ok());

        let err = ExecutionEngine::resolve(&def, "linux").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformUnsupported);
    }

    #[test]
    fn test_validate_command_blacklist() {
        assert!(ExecutionEngine::validate_command("rm -rf /").is_err());
        assert!(ExecutionEngine::validate_command("sudo  rm   -rf /  ").is_err());
        assert!(ExecutionEngine::validate_command(":(){ :|:& };:").is_err());
        assert!(ExecutionEngine::validate_command("mkfs.ext4 /dev/sdb1").is_err());
        assert!(ExecutionEngine::validate_command("FORMAT C:").is_err());

        assert!(ExecutionEngine::validate_command("rm -rf /tmp/build").is_ok());
        assert!(ExecutionEngine::validate_command("echo hello").is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_command_execution() {
        let engine = ExecutionEngine::new();
        let result = engine.execute("echo hello", Duration::from_secs(5)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output, "hello\n");
        assert_eq!(result.exit_code, 0);
        assert!(result.error.is_none());
        assert!(result.duration_ms < 5000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_report() {
        let engine = ExecutionEngine::new();
        let result = engine
            .execute("echo out; echo err >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.output.starts_with("out\n"));
        assert!(result.output.contains("STDERR:\nerr"));
    }

    /// Zombies waiting for a reaper count as gone
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_execution_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg");
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let engine = ExecutionEngine::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            engine.execute(&command, Duration::from_secs(20)),
        )
        .await;
        assert!(abandoned.is_err(), "execution should still be running");

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if !process_running(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background process {} survived the dropped execution", pid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let command = format!("echo started; echo $$ > {}; exec sleep 10", pid_file.display());

        let engine = ExecutionEngine::new();
        let started = Instant::now();
        let err = engine.execute(&command, Duration::from_millis(500)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));

        match err {
            ExecutionError::Timeout { output, .. } => assert!(output.contains("started")),
            other => panic!("expected timeout, got {:?}", other),
        }

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "process {} still running after timeout", pid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sequence_aborts_at_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("should-not-exist");

        let steps = vec![
            shell("echo ok"),
            CommandStep::Delay { duration_ms: 100 },
            shell("echo boom; exit 1"),
            shell(&format!("touch {}", marker.display())),
        ];

        let engine = ExecutionEngine::new();
        let result = engine.execute_sequence(&steps, Duration::from_secs(5)).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(3));
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("ok\n"));
        assert!(result.output.contains("boom"));
        assert!(result.error.unwrap().contains("step 3"));
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sequence_success() {
        let steps = vec![shell("echo one"), CommandStep::Delay { duration_ms: 10 }, shell("echo two")];
        let engine = ExecutionEngine::new();
        let result = engine.execute_sequence(&steps, Duration::from_secs(5)).await.unwrap();

        assert!(result.success);
        assert!(result.failed_step.is_none());
        let one = result.output.find("one").unwrap();
        let two = result.output.find("two").unwrap();
        assert!(one < two);
    }

    #[tokio::test]
    async fn test_unsupported_step_aborts() {
        let steps = vec![CommandStep::Unsupported, shell("echo never")];
        let engine = ExecutionEngine::new();
        let result = engine.execute_sequence(&steps, Duration::from_secs(5)).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_step, Some(1));
        assert!(!result.output.contains("never"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_interrupted_by_deadline() {
        let steps = vec![CommandStep::Delay { duration_ms: 10_000 }];
        let engine = ExecutionEngine::new();
        let err = engine
            .execute_sequence(&steps, Duration::from_millis(200))
            .await
            .unwrap_err();

        match err {
            ExecutionError::Timeout { failed_step, .. } => assert_eq!(failed_step, Some(1)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_rejects_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let def = definition(vec![(
            "all",
            PlatformCommand::Sequence(vec![shell(&format!("touch {}", marker.display())), shell("rm -rf /")]),
        )]);

        let engine = ExecutionEngine::new();
        let err = engine.run(&def, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_platform_unsupported() {
        let def = definition(vec![("plan9", PlatformCommand::Single("echo hi".into()))]);
        let engine = ExecutionEngine::with_platform("linux");
        let err = engine.run(&def, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::PlatformUnsupported { .. }));
    }
}
