//! External command-line tools (`ogr2ogr`, `tippecanoe`, `tile-join`, ...).
//!
//! The only contract with a tool is its exit status and, for jobs that name
//! one, the file it leaves behind. Stderr is kept for the error message but
//! never parsed.

use std::{path::Path, process::Stdio};

use tokio::{fs::File, process::Command};
use tracing::debug;

use crate::{
    error::{Error, Result},
    layout::remove_if_exists,
    protocol::ToolJob,
};

/// Runs `job` and checks that its output file exists afterwards.
pub async fn run(job: &ToolJob) -> Result<()> {
    let output = Path::new(&job.output);
    // a stale file from an earlier run must not count as success
    remove_if_exists(output)?;

    let mut command = Command::new(&job.program);
    command.args(&job.args).stdin(Stdio::null()).kill_on_drop(true);
    if job.capture_stdout {
        command.stdout(File::create(output).await?.into_std().await);
    } else {
        command.stdout(Stdio::null());
    }
    execute(&job.program, command).await?;

    if !output.exists() {
        Err(Error::ToolFailed {
            tool: job.program.clone(),
            reason: format!("expected output {} was not produced", output.display()),
        })?
    }
    debug!(job = %job.label, output = %output.display(), "tool finished");
    Ok(())
}

/// Runs a command whose only contract is a zero exit status.
pub async fn run_command(program: &str, args: &[String], env: &[(&str, &str)]) -> Result<()> {
    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    execute(program, command).await
}

async fn execute(program: &str, mut command: Command) -> Result<()> {
    command.stderr(Stdio::piped());
    let child = command.spawn().map_err(|e| Error::ToolFailed {
        tool: program.to_string(),
        reason: format!("could not start: {e}"),
    })?;
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::ToolFailed {
            tool: program.to_string(),
            reason: format!("{}: {}", output.status, stderr.trim()),
        })?
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(program: &str, args: &[&str], output: &Path, capture_stdout: bool) -> ToolJob {
        ToolJob {
            label: "test".into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            output: output.display().to_string(),
            capture_stdout,
        }
    }

    #[tokio::test]
    async fn captured_stdout_becomes_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("joined.geojson");
        run(&job("echo", &["{}"], &out, true)).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "{}\n");
    }

    #[tokio::test]
    async fn missing_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never.mbtiles");
        let err = run(&job("true", &[], &out, false)).await.unwrap_err();
        assert!(matches!(err, Error::ToolFailed { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x.mbtiles");
        std::fs::write(&out, b"stale").unwrap();
        let err = run(&job("false", &[], &out, false)).await.unwrap_err();
        assert!(matches!(err, Error::ToolFailed { tool, .. } if tool == "false"));
        // the stale file was cleared first
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn unknown_programs_are_reported() {
        let err = run_command("nbm-no-such-tool", &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::ToolFailed { .. }));
    }
}
