use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::ToolchainError;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub wall_timeout: Duration,
    /// Per stream; excess output is drained and dropped.
    pub max_output_bytes: usize,
}

impl ProcessLimits {
    pub fn with_timeout(wall_timeout: Duration) -> Self {
        Self {
            wall_timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChildOutput {
    pub exit_status: i32,
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
}

impl ChildOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs `cmd` to completion or until `limits.wall_timeout` elapses.
///
/// The child is started in its own process group, and that group is killed once
/// the child exits or times out, so nothing it forked outlives the call. stdout
/// and stderr are drained on two threads for the whole lifetime of the child;
/// both are joined before returning, including after a kill.
pub fn run_with_wall_timeout(
    mut cmd: Command,
    limits: &ProcessLimits,
) -> Result<ChildOutput, ToolchainError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            cmd.pre_exec(isolate_child);
        }
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ToolchainError::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!(program = %program, pid = child.id(), "child spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = limits.max_output_bytes;
    let stdout_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        match stdout {
            Some(r) => read_to_end_capped(r, cap),
            None => Ok((Vec::new(), false)),
        }
    });
    let stderr_thread = std::thread::spawn(move || -> std::io::Result<(Vec<u8>, bool)> {
        match stderr {
            Some(r) => read_to_end_capped(r, cap),
            None => Ok((Vec::new(), false)),
        }
    });

    let waited = wait_child_with_wall_timeout(&mut child, limits.wall_timeout);
    // Background descendants can outlive the child and hold the pipes open.
    kill_process_group(&child);
    let stdout_res = stdout_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)));
    let stderr_res = stderr_thread
        .join()
        .unwrap_or_else(|_| Ok((Vec::new(), false)));

    let wait_err = |source: std::io::Error| ToolchainError::Wait {
        program: program.clone(),
        source,
    };
    let (status, timed_out) = waited.map_err(wait_err)?;
    let (stdout, stdout_truncated) = stdout_res.map_err(wait_err)?;
    let (stderr, stderr_truncated) = stderr_res.map_err(wait_err)?;

    if timed_out {
        warn!(program = %program, timeout = ?limits.wall_timeout, "child killed on timeout");
    }

    #[cfg(unix)]
    let exit_signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let exit_signal: Option<i32> = None;

    let exit_status = match status.code() {
        Some(code) => code,
        None => exit_signal.map(|s| 128 + s).unwrap_or(1),
    };
    Ok(ChildOutput {
        exit_status,
        exit_signal,
        timed_out,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed: start.elapsed(),
    })
}

#[cfg(unix)]
fn isolate_child() -> std::io::Result<()> {
    unsafe {
        if libc::setpgid(0, 0) == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn wait_child_with_wall_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> std::io::Result<(ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status, false)),
            Ok(None) => {}
            Err(err) => {
                hard_kill(child);
                let _ = child.wait();
                return Err(err);
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            hard_kill(child);
            let status = child.wait()?;
            return Ok((status, true));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Kills the child's whole process group, then the child itself.
fn hard_kill(child: &mut std::process::Child) {
    kill_process_group(child);
    let _ = child.kill();
}

/// The group id is the child's pid (`setpgid(0, 0)` in [`isolate_child`]).
/// Once the group is empty this is a no-op `ESRCH`.
fn kill_process_group(child: &std::process::Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            unsafe {
                let _ = libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

pub fn read_to_end_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        if truncated {
            continue;
        }
        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(Duration::from_secs(10)))
            .expect("run sh");
        assert_eq!(out.exit_status, 3);
        assert!(!out.timed_out);
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err\n");
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & sleep 30; echo never"]);
        let start = Instant::now();
        let out = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(Duration::from_millis(300)))
            .expect("run sh");
        assert!(out.timed_out);
        assert_eq!(out.exit_signal, Some(libc::SIGKILL));
        assert_eq!(out.exit_status, 128 + libc::SIGKILL);
        assert!(out.stdout.is_empty());
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }

    #[test]
    fn background_descendant_does_not_hold_the_caller() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 8 & echo done; exit 0"]);
        let start = Instant::now();
        let out = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(Duration::from_secs(1)))
            .expect("run sh");
        assert!(!out.timed_out);
        assert_eq!(out.exit_status, 0);
        assert_eq!(out.stdout_text(), "done\n");
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[test]
    fn output_is_capped() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "i=0; while [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done"]);
        let limits = ProcessLimits {
            wall_timeout: Duration::from_secs(10),
            max_output_bytes: 64,
        };
        let out = run_with_wall_timeout(cmd, &limits).expect("run sh");
        assert_eq!(out.stdout.len(), 64);
        assert!(out.stdout_truncated);
        assert_eq!(out.exit_status, 0);
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let cmd = Command::new("/nonexistent/definitely-not-here");
        let err = run_with_wall_timeout(cmd, &ProcessLimits::with_timeout(Duration::from_secs(1)))
            .unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }), "{err}");
    }
}
