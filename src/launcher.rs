//! Launching backend processes
//!
//! A mountable's `Exec` template is split into argv and extended with the
//! spawner arguments (`--spawner <daemon name> <endpoint path>`) that tell the
//! backend where to acknowledge. Launching is fire-and-forget: the child is
//! reaped in the background and its exit only logged.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

/// One argv word: a double-quoted run, a single-quoted run, or bare text
static ARG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""((?:[^"\\]|\\.)*)"|'([^']*)'|(\S+)"#).expect("argv pattern is valid")
});

/// Split a command line into arguments, honouring single and double quotes
pub fn split_command_line(command: &str) -> Vec<String> {
    ARG_PATTERN
        .captures_iter(command)
        .filter_map(|caps| {
            if let Some(double) = caps.get(1) {
                Some(double.as_str().replace("\\\"", "\"").replace("\\\\", "\\"))
            } else if let Some(single) = caps.get(2) {
                Some(single.as_str().to_string())
            } else {
                caps.get(3).map(|bare| bare.as_str().to_string())
            }
        })
        .collect()
}

/// Full argv for launching a backend that must acknowledge at `endpoint_path`
pub fn spawn_command(exec: &str, daemon_name: &str, endpoint_path: &str) -> Vec<String> {
    let mut argv = split_command_line(exec);
    argv.push("--spawner".to_string());
    argv.push(daemon_name.to_string());
    argv.push(endpoint_path.to_string());
    argv
}

/// Starts backend processes
pub trait Launcher: Send + Sync {
    /// Start `argv` without waiting for it
    fn launch(&self, argv: &[String]) -> io::Result<()>;
}

/// Environment variable telling a launched backend where the bus socket is
pub const BUS_ADDRESS_ENV: &str = "MOUNT_TRACKER_BUS_ADDRESS";

/// Launches real processes via tokio
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher {
    bus_address: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass the bus socket to every launched backend in [`BUS_ADDRESS_ENV`]
    pub fn with_bus_address(mut self, socket: impl Into<PathBuf>) -> Self {
        self.bus_address = Some(socket.into());
        self
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, argv: &[String]) -> io::Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let mut command = tokio::process::Command::new(program);
        command.args(args).stdin(Stdio::null());
        if let Some(socket) = &self.bus_address {
            command.env(BUS_ADDRESS_ENV, socket);
        }
        let mut child = command.spawn()?;

        let pid = child.id();
        info!("Spawned backend {:?} (pid {:?})", program, pid);

        let program = program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Backend {:?} (pid {:?}) exited: {}", program, pid, status),
                Err(e) => warn!("Failed to reap backend {:?} (pid {:?}): {}", program, pid, e),
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain() {
        assert_eq!(
            split_command_line("/usr/libexec/vfsd-sftp  --debug"),
            vec!["/usr/libexec/vfsd-sftp", "--debug"]
        );
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(
            split_command_line(r#"/opt/my\ tools/vfsd "a b" 'c d' "say \"hi\"""#),
            vec!["/opt/my\\", "tools/vfsd", "a b", "c d", "say \"hi\""]
        );
    }

    #[test]
    fn test_spawn_command_appends_spawner_args() {
        let argv = spawn_command("/usr/libexec/vfsd-ftp", ":1.0", "/org/gtk/gvfs/exec_spaw/3");
        assert_eq!(
            argv,
            vec![
                "/usr/libexec/vfsd-ftp",
                "--spawner",
                ":1.0",
                "/org/gtk/gvfs/exec_spaw/3"
            ]
        );
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let launcher = ProcessLauncher::new();
        let argv = vec!["/nonexistent/mount-tracker-test-backend".to_string()];
        assert!(launcher.launch(&argv).is_err());
    }

    #[tokio::test]
    async fn test_launched_backend_sees_bus_address() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("address");
        let launcher = ProcessLauncher::new().with_bus_address("/tmp/mount-tracker-test.sock");

        let script = format!("printf %s \"${}\" > {}", BUS_ADDRESS_ENV, out.display());
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        launcher.launch(&argv).unwrap();

        let mut written = String::new();
        for _ in 0..100 {
            written = std::fs::read_to_string(&out).unwrap_or_default();
            if !written.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(written, "/tmp/mount-tracker-test.sock");
    }

    #[test]
    fn test_launch_empty_argv_fails() {
        let launcher = ProcessLauncher::new();
        let err = launcher.launch(&[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
