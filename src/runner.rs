use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::jobs::JobContext;

/// Spawn a whitelisted command in its own process group, stream its output
/// line-buffered into the job's event ring, and register a cancel handle
/// that terminates the whole tree. Non-zero exit is a runner failure.
pub async fn run_command(
    ctx: JobContext,
    program: &str,
    args: Vec<String>,
    cwd: PathBuf,
) -> anyhow::Result<()> {
    if ctx.is_cancelled() {
        bail!("cancelled before start");
    }

    let mut command = Command::new(program);
    command
        .args(&args)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {program}"))?;
    let pid = child.id();
    debug!(program, ?pid, "child spawned");

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    ctx.set_cancel(Box::new(move || {
        terminate_process_group(pid);
        let _ = kill_tx.send(());
    }));

    let stdout = child.stdout.take().context("child stdout is piped")?;
    let stderr = child.stderr.take().context("child stderr is piped")?;

    // Reader tasks run to EOF regardless of when the child exits, so no
    // trailing output is lost. `next_line` splits on \r?\n and yields a
    // final partial line before EOF.
    let stdout_ctx = ctx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stdout_ctx.log_stdout(line);
        }
    });
    let stderr_ctx = ctx.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stderr_ctx.log_stderr(line);
        }
    });

    let status = tokio::select! {
        status = child.wait() => status.context("waiting for child")?,
        _ = &mut kill_rx => {
            // The group already received SIGTERM from the cancel handle;
            // make sure the direct child is gone too.
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            bail!("terminated by cancellation");
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    if !status.success() {
        bail!("{program} exited with {status}");
    }
    Ok(())
}

/// SIGTERM the child's process group. Spawning with `process_group(0)`
/// makes the child's pid the group id, so forked grandchildren die too.
#[cfg(unix)]
fn terminate_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::run_command;
    use crate::jobs::{JobEvent, JobManager, JobState, LogStream};
    use std::time::{Duration, Instant};

    fn manager() -> JobManager {
        JobManager::new(1, Duration::from_secs(60))
    }

    async fn wait_terminal(manager: &JobManager, id: uuid::Uuid) -> Vec<JobEvent> {
        let (mut events, mut rx) = manager.subscribe(id).expect("job exists");
        if events.iter().any(JobEvent::is_terminal_state) {
            return events;
        }
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Ok(event)) => {
                    let terminal = event.is_terminal_state();
                    events.push(event);
                    if terminal {
                        return events;
                    }
                }
                Ok(Err(_)) => continue,
                Err(_) => panic!("timed out waiting for terminal event"),
            }
        }
    }

    #[tokio::test]
    async fn streams_lines_and_flushes_trailing_partials() {
        let manager = manager();
        let cwd = std::env::temp_dir();
        let job = manager.enqueue(move |ctx| {
            run_command(
                ctx,
                "sh",
                vec![
                    "-c".to_string(),
                    "echo one; echo two 1>&2; printf partial".to_string(),
                ],
                cwd,
            )
        });

        let events = wait_terminal(&manager, job.id).await;
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Log { stream: LogStream::Stdout, line } if line == "one"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Log { stream: LogStream::Stderr, line } if line == "two"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Log { stream: LogStream::Stdout, line } if line == "partial"
        )));
        assert_eq!(manager.get(job.id).expect("snapshot").state, JobState::Done);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_job() {
        let manager = manager();
        let cwd = std::env::temp_dir();
        let job = manager.enqueue(move |ctx| {
            run_command(ctx, "sh", vec!["-c".to_string(), "exit 3".to_string()], cwd)
        });

        wait_terminal(&manager, job.id).await;
        let snapshot = manager.get(job.id).expect("snapshot");
        assert_eq!(snapshot.state, JobState::Error);
        assert!(snapshot.error.expect("error").message.contains("exited"));
    }

    #[tokio::test]
    async fn cancellation_kills_a_sleeping_child_promptly() {
        let manager = manager();
        let cwd = std::env::temp_dir();
        let job = manager.enqueue(move |ctx| {
            run_command(ctx, "sh", vec!["-c".to_string(), "sleep 30".to_string()], cwd)
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        manager
            .cancel(job.id)
            .expect("job exists")
            .expect("running job is cancellable");

        let events = wait_terminal(&manager, job.id).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            events.last().expect("events"),
            JobEvent::State { state: JobState::Cancelled, .. }
        ));
    }
}
