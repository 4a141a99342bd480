// Child process launch and lifecycle for stdio MCP servers
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::descriptor::ServerDescriptor;
use crate::errors::McpError;

/// Cap on retained stderr output; oldest text is dropped first.
const STDERR_TAIL_LIMIT: usize = 4096;

/// A spawned server process with its pipes available for the session layer.
/// Dropping it kills the child (`kill_on_drop`), so no exit path leaks one.
pub struct ManagedProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<String>>,
}

/// Starts the described server with piped stdio. The caller's environment is
/// inherited, descriptor overrides win on conflict, and `NODE_NO_WARNINGS=1`
/// is always set on top: Node-based servers otherwise print warning banners
/// that pollute the startup stream.
pub async fn launch(descriptor: &ServerDescriptor) -> Result<ManagedProcess, McpError> {
    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);
    for (key, value) in &descriptor.env {
        cmd.env(key, value);
    }
    cmd.env("NODE_NO_WARNINGS", "1");
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| McpError::Launch {
        command: descriptor.command.clone(),
        source,
    })?;

    let missing_pipe = |what: &str| McpError::Launch {
        command: descriptor.command.clone(),
        source: std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{what} pipe was not captured"),
        ),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let stderr_tail = spawn_stderr_drain(descriptor.identifier.clone(), stderr);
    debug!(
        server = %descriptor.identifier,
        pid = ?child.id(),
        command = %descriptor.command,
        "server process launched"
    );

    Ok(ManagedProcess {
        child,
        stdin: Some(stdin),
        stdout: Some(stdout),
        stderr_tail,
    })
}

impl ManagedProcess {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Shared handle to the stderr tail buffer, for error reporting from
    /// tasks that outlive this struct's borrow.
    pub fn stderr_tail_handle(&self) -> Arc<Mutex<String>> {
        Arc::clone(&self.stderr_tail)
    }

    /// Snapshot of the most recent stderr output.
    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.clone()
    }

    /// Terminates the child. Errors are ignored: the process may already
    /// have exited on its own.
    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!("kill after exit: {}", err);
        }
    }
}

/// Drains stderr line by line into a bounded tail buffer. Stderr is never
/// parsed as protocol; it only feeds logs and error messages.
fn spawn_stderr_drain(identifier: String, stderr: ChildStderr) -> Arc<Mutex<String>> {
    let tail: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let buf = Arc::clone(&tail);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        debug!(server = %identifier, "stderr: {}", trimmed);
                    }
                    let mut guard = buf.lock().await;
                    guard.push_str(&line);
                    if guard.len() > STDERR_TAIL_LIMIT {
                        let mut cut = guard.len() - STDERR_TAIL_LIMIT;
                        while !guard.is_char_boundary(cut) {
                            cut += 1;
                        }
                        guard.drain(..cut);
                    }
                }
                Err(err) => {
                    warn!(server = %identifier, "stderr read failed: {}", err);
                    break;
                }
            }
        }
    });
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(identifier: &str, script: &str) -> ServerDescriptor {
        ServerDescriptor::new(identifier, "sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn launch_missing_binary_reports_command() {
        let descriptor = ServerDescriptor::new("ghost", "definitely-not-a-real-binary-1234");
        let err = launch(&descriptor).await.err().unwrap();
        assert!(matches!(err, McpError::Launch { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-binary-1234"));
    }

    #[tokio::test]
    async fn descriptor_env_overrides_parent_env() {
        std::env::set_var("PROC_ENV_TEST", "parent");
        let descriptor =
            sh("env-check", "printf '%s:%s' \"$PROC_ENV_TEST\" \"$NODE_NO_WARNINGS\"")
                .with_env("PROC_ENV_TEST", "child");
        let mut process = launch(&descriptor).await.unwrap();

        let mut stdout = process.take_stdout().unwrap();
        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "child:1");
        std::env::remove_var("PROC_ENV_TEST");
    }

    #[tokio::test]
    async fn stderr_tail_captures_diagnostics() {
        let descriptor = sh("noisy", "echo 'boom: config missing' >&2");
        let process = launch(&descriptor).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let tail = process.stderr_tail().await;
        assert!(tail.contains("boom: config missing"));
    }
}
