use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;

/// Combined stdout+stderr is capped at this many bytes.
const MAX_PROGRAM_OUTPUT: usize = 64 * 1024;

/// Runs an external program with a deadline and returns its combined
/// stdout+stderr. The child is killed if the deadline elapses. A non-zero
/// exit turns into an error that carries the captured output.
pub async fn invoke_program(program: &str, args: &[&str], deadline: Duration) -> anyhow::Result<String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(deadline, child)
        .await
        .with_context(|| format!("{}: time limit exceeded", program))?
        .with_context(|| format!("failed to launch {}", program))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if combined.len() > MAX_PROGRAM_OUTPUT {
        combined.truncate(MAX_PROGRAM_OUTPUT);
    }
    let combined = combined.trim().to_owned();

    if !output.status.success() {
        anyhow::bail!("{} exited with {}: {}", program, output.status, combined);
    }
    Ok(combined)
}
