// src/client_monitor.rs
// Supervision of the nym-client subprocess

use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

const RESTART_PAUSE: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Keeps the local mix client alive. Its output is drained straight to the
/// log; the receive loop never looks at it.
pub struct ClientMonitor {
    binary: PathBuf,
    client_id: String,
}

impl ClientMonitor {
    pub fn new(binary: impl Into<PathBuf>, client_id: impl Into<String>) -> Self {
        ClientMonitor {
            binary: binary.into(),
            client_id: client_id.into(),
        }
    }

    fn config_dir(&self) -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        PathBuf::from(home)
            .join(".nym")
            .join("clients")
            .join(&self.client_id)
    }

    /// First-run initialization of the nym client config.
    pub async fn init_if_needed(&self) -> Result<(), String> {
        if self.config_dir().exists() {
            info!("client: existing nym config found, skipping init");
            return Ok(());
        }
        info!("client: initializing nym client '{}'", self.client_id);
        let status = Command::new(&self.binary)
            .args(["init", "--id", &self.client_id, "--host", "0.0.0.0"])
            .status()
            .await
            .map_err(|e| format!("cannot run {}: {}", self.binary.display(), e))?;
        if !status.success() {
            return Err(format!("nym-client init exited with {}", status));
        }
        Ok(())
    }

    /// Run the client, restarting after a pause when it dies, until
    /// shutdown. On shutdown the child gets SIGINT and a bounded grace
    /// period before being killed.
    pub async fn supervise(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    error!("client: failed to start nym client: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_PAUSE) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };
            info!("client: nym client started (pid {:?})", child.id());

            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => error!(
                            "client: nym client exited with {}, restarting in {:?}",
                            status, RESTART_PAUSE
                        ),
                        Err(e) => error!("client: wait on nym client failed: {}", e),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_PAUSE) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                _ = shutdown.changed() => {
                    self.stop(child).await;
                    return;
                }
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut child = Command::new(&self.binary)
            .args(["run", "--id", &self.client_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain("nym-client", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain("nym-client stderr", stderr));
        }
        Ok(child)
    }

    async fn stop(&self, mut child: Child) {
        if let Some(pid) = child.id() {
            info!("client: sending SIGINT to nym client (pid {})", pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("client: nym client shut down ({})", status);
                    return;
                }
                Ok(Err(e)) => warn!("client: wait on nym client failed: {}", e),
                Err(_) => warn!("client: nym client ignored SIGINT, killing"),
            }
        }
        let _ = child.kill().await;
    }
}

async fn drain<R: AsyncRead + Unpin>(label: &'static str, reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{}: {}", label, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn config_dir_is_under_the_home_nym_tree() {
        let monitor = ClientMonitor::new("./nym-client", "server-1");
        let dir = monitor.config_dir();
        assert!(dir.ends_with(".nym/clients/server-1"));
    }

    #[tokio::test]
    async fn supervisor_stops_the_child_on_shutdown() {
        // Stand-in client that just sleeps; accepts the run/--id arguments.
        let dir = std::env::temp_dir()
            .join(format!("nym-directory-monitor-{:016x}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("fake-client.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let monitor = ClientMonitor::new(&script, "test");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = tokio::spawn(async move { monitor.supervise(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        // The supervisor must come back well inside the grace period.
        tokio::time::timeout(Duration::from_secs(10), supervisor)
            .await
            .expect("supervisor did not stop")
            .unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
