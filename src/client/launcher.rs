//! # Service Launcher
//!
//! Starts the background service as a detached process and keeps concurrent
//! invocations from starting more than one.
//!
//! ## Detaching:
//! The service is this same executable re-run with the `serve` subcommand. It
//! gets its own process group (so a Ctrl+C in the invoking terminal does not
//! reach it), no stdin/stdout, and stderr appended to a log file in the temp
//! directory.
//!
//! ## Single-spawn guard:
//! A lock file created with create-new semantics marks "someone is starting
//! the service on this port". Whoever creates it spawns; everyone else only
//! polls. A lock older than the startup window is left over from a crashed
//! invocation and is replaced.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Starts a service process. Returns once the process is spawned, not when it is ready.
pub trait ServiceLauncher: Send + Sync {
    fn launch(&self) -> AppResult<()>;
}

pub struct ProcessLauncher {
    pub config_path: Option<PathBuf>,
    pub expandable_segments: bool,
    pub port: u16,
}

impl ProcessLauncher {
    fn log_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("whisper-relay-{}.log", self.port))
    }

    fn command(&self) -> AppResult<Command> {
        let exe = std::env::current_exe()
            .map_err(|e| AppError::Internal(format!("cannot locate own executable: {}", e)))?;

        let mut command = Command::new(exe);
        command.arg("serve");
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        if self.expandable_segments {
            command.env("PYTORCH_CUDA_ALLOC_CONF", "expandable_segments:True");
        }

        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .map(Stdio::from)
            .unwrap_or_else(|_| Stdio::null());
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(stderr);

        detach(&mut command);
        Ok(command)
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

impl ServiceLauncher for ProcessLauncher {
    fn launch(&self) -> AppResult<()> {
        let child = self
            .command()?
            .spawn()
            .map_err(|e| AppError::Internal(format!("failed to spawn service: {}", e)))?;
        tracing::info!(
            pid = child.id(),
            log = %self.log_path().display(),
            "Starting server..."
        );
        // Not waited on: the service outlives this invocation
        drop(child);
        Ok(())
    }
}

/// Held by the one invocation allowed to spawn a service; removed on drop.
#[derive(Debug)]
pub struct SpawnLock {
    path: PathBuf,
}

impl SpawnLock {
    pub fn default_path(port: u16) -> PathBuf {
        std::env::temp_dir().join(format!("whisper-relay-{}.spawn.lock", port))
    }

    /// Try to become the spawner.
    ///
    /// `Ok(None)` means another invocation holds a fresh lock and is starting
    /// the service already.
    pub fn acquire(path: &Path, stale_after: Duration) -> std::io::Result<Option<Self>> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Holder pid, for humans inspecting a stuck lock
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !is_stale(path, stale_after) {
                        return Ok(None);
                    }
                    tracing::warn!(path = %path.display(), "Replacing stale spawn lock");
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        // Lost the race for the stale lock to another invocation
        Ok(None)
    }
}

impl Drop for SpawnLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_one_holder_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawn.lock");
        let first = SpawnLock::acquire(&path, Duration::from_secs(60)).unwrap();
        assert!(first.is_some());
        assert!(SpawnLock::acquire(&path, Duration::from_secs(60)).unwrap().is_none());

        drop(first);
        assert!(!path.exists());
        assert!(SpawnLock::acquire(&path, Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spawn.lock");
        std::fs::write(&path, "12345\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let lock = SpawnLock::acquire(&path, Duration::from_millis(1)).unwrap();
        assert!(lock.is_some());
        let holder = std::fs::read_to_string(&path).unwrap();
        assert_eq!(holder.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_serve_command_carries_config_and_env() {
        let launcher = ProcessLauncher {
            config_path: Some(PathBuf::from("/etc/whisper/config.json")),
            expandable_segments: true,
            port: 8000,
        };
        let command = launcher.command().unwrap();

        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["serve", "--config", "/etc/whisper/config.json"]);

        let env: Vec<_> = command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(env.contains(&(
            "PYTORCH_CUDA_ALLOC_CONF".to_string(),
            "expandable_segments:True".to_string()
        )));
    }
}
