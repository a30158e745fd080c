use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

/// A running `leaderd` whose log lines are collected from stdout.
#[derive(Debug)]
pub(crate) struct LeaderdEnv {
    daemon: Child,
    lines: Receiver<String>,
}

impl LeaderdEnv {
    pub(crate) fn start(config: &str, app_name: &str) -> Self {
        Self::spawn(config, None, &[&format!("--app-name={app_name}")])
    }

    /// Start from `dir`, where `leaderd` picks up a `.env` file.
    pub(crate) fn start_in(config: &str, dir: &Path) -> Self {
        Self::spawn(config, Some(dir), &[])
    }

    fn spawn(config: &str, dir: Option<&Path>, extra: &[&str]) -> Self {
        let config_path = format!("{}/tests/test_configs/{config}", env!("CARGO_MANIFEST_DIR"));
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_leaderd"));
        cmd.arg(format!("--config-path={config_path}"))
            .arg("--instance-id=test-instance")
            .arg("--threads=2")
            .arg("--log-format=json")
            .arg("--leaderd-log=debug")
            .args(extra)
            .stdout(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let mut daemon = cmd.spawn().expect("failed to start leaderd");

        let stdout = daemon.stdout.take().expect("stdout is piped");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self { daemon, lines }
    }

    /// Wait for a log line containing `needle`.
    pub(crate) fn wait_for_log(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(left) {
                Ok(line) if line.contains(needle) => return true,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Wait for the process to exit on its own.
    pub(crate) fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.daemon.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for LeaderdEnv {
    fn drop(&mut self) {
        let _ = self.daemon.kill();
        let _ = self.daemon.wait();
    }
}
