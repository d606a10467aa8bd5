//! Subprocess execution with a hard deadline.
//!
//! Both the git runner and the developer backend invoke host binaries that
//! can wedge (network hangs, interactive prompts). Output pipes are drained
//! on dedicated threads so a chatty child never fills its pipe buffer and
//! deadlocks against the wait loop.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `cmd` to completion or kill it at `timeout`.
///
/// Returns an error only for spawn failures or a blown deadline; a non-zero
/// exit is a normal [`ProcOutput`] the caller inspects.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<ProcOutput> {
    let label = format!("{cmd:?}");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || drain(stdout));
    let err_reader = std::thread::spawn(move || drain(stderr));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = out_reader.join();
                    let _ = err_reader.join();
                    anyhow::bail!(
                        "subprocess timed out after {}s: {label}",
                        timeout.as_secs()
                    );
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();

    Ok(ProcOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn drain(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}
