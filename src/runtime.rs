use crate::control::Supervisor;
use crate::error::SupervisorError;
use crate::parse::split_env_entry;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};


type KillRequest = oneshot::Sender<io::Result<()>>;

/// Point-in-time view of one service, as reported by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: u32,
    #[serde(rename = "environment_vars")]
    pub environment: Vec<String>,
    #[serde(rename = "executable_location")]
    pub executable_path: String,
}

impl ServiceStatus {
    pub fn stopped() -> Self {
        Self::default()
    }
}

// Live handle to a spawned service process.
// The child itself is owned by its termination watcher; the record talks to it
// through the exit channel and kill requests.
#[derive(Debug)]
pub struct ProcessRecord {
    pub(crate) id: u64,
    pid: u32,
    environment: Vec<String>,
    executable: String,
    exit: watch::Receiver<Option<String>>,
    kill_tx: mpsc::Sender<KillRequest>,
    killed: bool,
}

impl ProcessRecord {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Neither reaped nor already sent a kill.
    pub fn is_live(&self) -> bool {
        !self.killed && self.exit.borrow().is_none()
    }

    pub fn status(&self) -> ServiceStatus {
        if !self.is_live() {
            return ServiceStatus::stopped();
        }
        ServiceStatus {
            running: true,
            pid: self.pid,
            environment: self.environment.clone(),
            executable_path: self.executable.clone(),
        }
    }

    /*
        @@@
        @kill();
        . Asks the termination watcher to SIGKILL the child and waits for its answer.
        . Only the watcher touches the child, so a reaped pid is never signalled.
        . Losing the race against a natural exit is reported as NotRunning.
    */
    pub(crate) async fn kill(&mut self, name: &str) -> Result<(), SupervisorError> {
        let not_running = || SupervisorError::NotRunning { name: name.to_string() };
        let (reply_tx, reply_rx) = oneshot::channel();
        // A closed channel means the watcher already reaped the child.
        self.kill_tx.send(reply_tx).await.map_err(|_| not_running())?;
        let delivered = reply_rx.await.map_err(|_| not_running())?;
        delivered.map_err(|e| SupervisorError::Signal {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.killed = true;
        Ok(())
    }
}

/// Human readable exit, e.g. `exit status 3` or `killed by signal SIGSEGV`.
pub fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {}", code);
    }
    match status.signal() {
        Some(raw) => match Signal::try_from(raw) {
            Ok(sig) => format!("killed by signal {}", sig),
            Err(_) => format!("killed by signal {}", raw),
        },
        None => String::from("unknown exit"),
    }
}



/*
    @@@
    @spawn_process();
    . Starts `executable` with exactly `env` (or our own environment when `env` is empty),
      stdin on /dev/null and stdout/stderr piped.
    . Forwards both streams line by line into the service log from two reader tasks.
    . Hands the child to a termination watcher, then waits out the grace period.
    . A process that is gone by then is reported as an early exit instead of a record.
*/
pub(crate) async fn spawn_process(
    sup: &Supervisor,
    id: u64,
    name: &str,
    executable: &str,
    env: &[String],
    grace: Duration,
) -> Result<ProcessRecord, SupervisorError> {
    let mut cmd = Command::new(executable);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // An empty environment means "inherit ours", otherwise the child gets exactly `env`.
    if !env.is_empty() {
        cmd.env_clear();
    }
    for entry in env {
        let (key, value) = split_env_entry(entry).map_err(|e| SupervisorError::Spawn {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| {
        warn!(service = name, exec_location = executable, environment_vars = %env.join(", "), error = %e, "Couldn't spawn process");
        SupervisorError::Spawn {
            name: name.to_string(),
            reason: format!("error starting process: {}", e),
        }
    })?;

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(out), Some(err)) => (out, err),
        _ => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(SupervisorError::Spawn {
                name: name.to_string(),
                reason: String::from("couldn't capture stdout/stderr of the process"),
            });
        }
    };
    let pid = child.id().unwrap_or_default();
    info!(service = name, pid, exec_location = executable, "Spawned process");

    forward_lines(sup.clone(), name.to_string(), stdout, "stdout");
    forward_lines(sup.clone(), name.to_string(), stderr, "stderr");

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    tokio::spawn(watch_termination(
        sup.clone(),
        name.to_string(),
        id,
        child,
        exit_tx,
        kill_rx,
    ));

    sleep(grace).await;

    let exited = exit_rx.borrow().clone();
    if let Some(status) = exited {
        warn!(service = name, pid, grace_ms = grace.as_millis() as u64, %status, "Exited before grace period");
        return Err(SupervisorError::EarlyExit {
            name: name.to_string(),
            grace,
            status,
        });
    }

    debug!(service = name, pid, grace_ms = grace.as_millis() as u64, "Marked healthy after grace period");
    Ok(ProcessRecord {
        id,
        pid,
        environment: env.to_vec(),
        executable: executable.to_string(),
        exit: exit_rx,
        kill_tx,
        killed: false,
    })
}



// One reader per output stream; ends when the child closes its end of the pipe.
fn forward_lines<R>(sup: Supervisor, name: String, stream: R, source: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if let Err(e) = sup.append_to_log(&name, line).await {
                        warn!(service = %name, stream = source, error = %e, "dropping output line");
                    }
                }
                Err(e) => {
                    warn!(service = %name, stream = source, error = %e, "error reading process output");
                    break;
                }
            }
        }
        debug!(service = %name, stream = source, "output stream closed");
    });
}



/*
    @@@
    @watch_termination();
    . Owns the child until it exits; kill requests from `stop` are served here.
    . Publishes the exit description, then clears the service's record if it is still ours.
    . Unless the exit came from our own kill, failures are appended to the service log.
*/
async fn watch_termination(
    sup: Supervisor,
    name: String,
    id: u64,
    mut child: Child,
    exit_tx: watch::Sender<Option<String>>,
    mut kill_rx: mpsc::Receiver<KillRequest>,
) {
    let mut killed = false;
    let waited = loop {
        tokio::select! {
            res = child.wait() => break res,
            Some(reply) = kill_rx.recv() => {
                let res = child.start_kill();
                if res.is_ok() {
                    killed = true;
                }
                let _ = reply.send(res);
            }
        }
    };
    let (description, failed) = match &waited {
        Ok(status) => (describe_exit(status), !status.success()),
        Err(e) => (format!("wait failed: {}", e), true),
    };
    // Publish the exit before refusing kills, so `is_live` flips first.
    exit_tx.send_replace(Some(description.clone()));
    // Pending kill requests get an error now; `stop` may hold the lock we need below.
    drop(kill_rx);

    sup.clear_process(&name, id).await;

    if killed {
        info!(service = %name, status = %description, "Service stopped");
    } else if failed {
        error!(service = %name, status = %description, "Service errored out");
        if let Err(e) = sup.append_to_log(&name, format!("exited: {}", description)).await {
            warn!(service = %name, error = %e, "couldn't record exit in log");
        }
    } else {
        info!(service = %name, "Service exited cleanly");
    }
}
