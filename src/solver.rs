use std::{fmt, path::{Path, PathBuf}, process::Stdio, time::Duration};

use futures::StreamExt;
use tokio::{io::AsyncRead, process::Command};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::network::codec::LineCodec;

/// How a solver run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Success,
    /// the exit code, `None` if the solver was terminated by a signal
    NonZeroExit(Option<i32>),
    LaunchFailure(String),
    Interrupted,
    Timeout,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::NonZeroExit(Some(code)) => write!(f, "exited with code {}", code),
            Outcome::NonZeroExit(None) => write!(f, "terminated by a signal"),
            Outcome::LaunchFailure(cause) => write!(f, "could not be started: {}", cause),
            Outcome::Interrupted => write!(f, "interrupted"),
            Outcome::Timeout => write!(f, "timed out"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Runner {
    pub timeout: Option<Duration>,
    pub capture_output: bool,
}

/* a relative program with a directory component is resolved against the working directory */
fn program(working_dir: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        working_dir.join(path)
    }
    else {
        path.to_owned()
    }
}

fn forward<R>(stream: Option<R>, source: &'static str, id: String)
    where R: AsyncRead + Unpin + Send + 'static {
    if let Some(stream) = stream {
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stream, LineCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                log::debug!("{} {}: {}", id, source, line);
            }
        });
    }
}

/* the solver leads its own process group, whatever it started goes down with it */
#[cfg(unix)]
fn kill_group(id: &str, pid: u32) {
    let pgid = match libc::pid_t::try_from(pid) {
        Ok(pgid) => pgid,
        Err(_) => {
            log::error!("{} Process id {} is out of range", id, pid);
            return;
        }
    };
    /* SAFETY: killpg only sends a signal */
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result != 0 {
        log::debug!("{} Could not signal process group: {}", id, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_group(_id: &str, _pid: u32) {}

impl Runner {
    pub fn new(timeout: Option<Duration>, capture_output: bool) -> Self {
        Runner { timeout, capture_output }
    }

    /// Runs `command_line` inside `working_dir` until it exits, the timeout expires, or
    /// `cancel` is triggered. Output is either discarded or forwarded line by line to the
    /// log, it is never accumulated.
    pub async fn run(&self, working_dir: &Path, command_line: &str, cancel: &CancellationToken) -> Outcome {
        let mut words = command_line.split_whitespace();
        let executable = match words.next() {
            Some(executable) => program(working_dir, executable),
            None => return Outcome::LaunchFailure("empty command line".to_owned()),
        };
        let (stdout, stderr) = match self.capture_output {
            true => (Stdio::piped(), Stdio::piped()),
            false => (Stdio::null(), Stdio::null()),
        };
        let mut command = Command::new(&executable);
        command.args(words)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => return Outcome::LaunchFailure(format!("{}: {}", executable.display(), error)),
        };
        let pid = child.id();
        let id = format!("[{}]", pid.map_or_else(|| "?".to_owned(), |pid| pid.to_string()));
        log::info!("{} Started {} in {}", id, command_line, working_dir.display());
        forward(child.stdout.take(), "stdout", id.clone());
        forward(child.stderr.take(), "stderr", id.clone());

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => futures::future::pending().await,
            }
        };
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => return Outcome::Success,
                Ok(status) => return Outcome::NonZeroExit(status.code()),
                Err(error) => return Outcome::LaunchFailure(error.to_string()),
            },
            _ = deadline => Outcome::Timeout,
            _ = cancel.cancelled() => Outcome::Interrupted,
        };
        log::warn!("{} Solver {}, terminating", id, outcome);
        if let Some(pid) = pid {
            kill_group(&id, pid);
        }
        if let Err(error) = child.kill().await {
            log::error!("{} Could not terminate solver: {}", id, error);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn script(dir: &Path, contents: &str) {
        tokio::fs::write(dir.join("solver.sh"), contents).await.unwrap();
    }

    #[tokio::test]
    async fn exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::default();
        let cancel = CancellationToken::new();
        script(dir.path(), "echo 1 2 > route.txt\n").await;
        assert_eq!(runner.run(dir.path(), "sh solver.sh", &cancel).await, Outcome::Success);
        assert!(dir.path().join("route.txt").exists());
        script(dir.path(), "exit 3\n").await;
        assert_eq!(runner.run(dir.path(), "sh solver.sh", &cancel).await, Outcome::NonZeroExit(Some(3)));
    }

    #[tokio::test]
    async fn launch_failures() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runner = Runner::new(None, true);
        assert!(matches!(runner.run(dir.path(), "./does-not-exist", &cancel).await,
                         Outcome::LaunchFailure(_)));
        assert!(matches!(runner.run(dir.path(), "  ", &cancel).await, Outcome::LaunchFailure(_)));
    }

    #[tokio::test]
    async fn captured_output_does_not_change_outcome() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "echo working\necho oops >&2\nexit 0\n").await;
        let runner = Runner::new(None, true);
        assert_eq!(runner.run(dir.path(), "sh solver.sh", &CancellationToken::new()).await,
                   Outcome::Success);
    }

    #[tokio::test]
    async fn timeout_kills_the_solver() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "sleep 30\n").await;
        let runner = Runner::new(Some(Duration::from_millis(200)), false);
        let started = std::time::Instant::now();
        assert_eq!(runner.run(dir.path(), "sh solver.sh", &CancellationToken::new()).await,
                   Outcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_what_the_solver_started() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "( sleep 1; echo 9 9 > route.txt ) &\nwait\n").await;
        let runner = Runner::new(Some(Duration::from_millis(200)), false);
        assert_eq!(runner.run(dir.path(), "sh solver.sh", &CancellationToken::new()).await,
                   Outcome::Timeout);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("route.txt").exists());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_solver() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "sleep 30\n").await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        assert_eq!(Runner::default().run(dir.path(), "sh solver.sh", &cancel).await,
                   Outcome::Interrupted);
    }
}
