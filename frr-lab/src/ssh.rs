// FrrLab: External BGP speaker and cluster sampling for route-advertisement tests
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! SSH access to the host running the external router.
//!
//! Every command runs through its own `ssh` process, but all of them share one multiplexed
//! connection (`ControlMaster`), so only the first command pays for the handshake. The remote
//! shell joins all arguments with spaces; use [`shell_quote`] for arguments that contain
//! whitespace or shell syntax.

use std::{
    ffi::OsString,
    io,
    path::Path,
    process::{Command as StdCommand, ExitStatus, Output},
    string::FromUtf8Error,
    time::Duration,
};

use itertools::Itertools;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

use crate::config::HostConfig;

/// Time to wait for the first command of a session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Echoed by the host when the session is opened.
const PROBE: &str = "frr-lab-ready";

/// Session with the host running the external router.
///
/// The session itself holds no connection. It remembers the destination and the options passed
/// to every `ssh` and `scp` invocation:
///
/// - `-oControlMaster=auto`, `-oControlPath=/tmp/.ssh-%r@%h:%p` and `-oControlPersist=30m`
/// - `-oBatchMode=yes`, so a missing key fails instead of prompting for a password
/// - `-oUser=` and `-oIdentityFile=` if the [`HostConfig`] names them. Otherwise, both are taken
///   from `~/.ssh/config`.
#[derive(Debug, Clone)]
pub struct SshSession {
    destination: String,
    options: Vec<OsString>,
}

impl SshSession {
    /// Open a session with the host, and check that it executes commands without asking for a
    /// password.
    pub async fn new(host: &HostConfig) -> Result<Self, SshError> {
        let session = Self {
            destination: host.ssh_name.clone(),
            options: connection_options(host),
        };
        log::trace!("[{}] connecting...", session.name());

        let echoed = timeout(CONNECT_TIMEOUT, session.execute_cmd_stdout(&["echo", PROBE]))
            .await
            .map_err(|_| SshError::Timeout(session.destination.clone()))??;
        if echoed.trim() != PROBE {
            return Err(SshError::Setup {
                host: session.destination,
                reason: format!("expected `{PROBE}`, but the host printed `{}`", echoed.trim()),
            });
        }

        log::debug!("[{}] session ready", session.name());
        Ok(session)
    }

    /// Destination of the session, as given to `ssh`.
    pub fn name(&self) -> &str {
        &self.destination
    }

    /// Execute a command on the host and return its output. Fails if the command exits with a
    /// non-zero status.
    pub async fn execute_cmd(&self, args: &[impl AsRef<str> + Sync]) -> Result<Output, SshError> {
        let line = args.iter().map(AsRef::as_ref).join(" ");
        let output = self.run(self.ssh(args), &line).await?;
        self.ensure_success(line, output)
    }

    /// Execute a command on the host and return its STDOUT. Fails if the command exits with a
    /// non-zero status. STDERR is only logged, as `sudo` and the container runtime regularly
    /// print warnings there.
    pub async fn execute_cmd_stdout(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<String, SshError> {
        let output = self.execute_cmd(args).await?;
        if !output.stderr.is_empty() {
            log::trace!(
                "[{}] STDERR of `{}`:\n{}",
                self.name(),
                args.iter().map(AsRef::as_ref).join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }

    /// Execute a shell command line on the host and return its STDOUT. The line is handed to the
    /// remote shell unchanged, so pipes and redirections are interpreted on the host.
    pub async fn execute_shell(&self, line: &str) -> Result<String, SshError> {
        self.execute_cmd_stdout(&[line]).await
    }

    /// Execute a command on the host and return its exit status without checking it.
    ///
    /// ```rust,no_run
    /// use frr_lab::{config::HostConfig, ssh::SshSession};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let session = SshSession::new(&HostConfig::new("frr-host")).await?;
    /// let present = session
    ///     .execute_cmd_status(&["test", "-d", "/tmp/frr-lab"])
    ///     .await?
    ///     .success();
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_cmd_status(
        &self,
        args: &[impl AsRef<str> + Sync],
    ) -> Result<ExitStatus, SshError> {
        let line = args.iter().map(AsRef::as_ref).join(" ");
        Ok(self.run(self.ssh(args), &line).await?.status)
    }

    /// Copy a local file to `remote` on the host.
    pub async fn copy_to(&self, local: &Path, remote: &str) -> Result<(), SshError> {
        let mut target = OsString::from(&self.destination);
        target.push(":");
        target.push(remote);

        let mut cmd = StdCommand::new("scp");
        cmd.args(&self.options).arg(local).arg(target);

        let line = format!("scp {} {}:{remote}", local.display(), self.destination);
        let output = self.run(cmd, &line).await?;
        self.ensure_success(line, output).map(|_| ())
    }

    /// Execute a shell command line on the host, blocking the current thread until it is done.
    /// This is meant for cleanup in [`Drop`] implementations, where no runtime can be awaited.
    pub fn execute_shell_blocking(&self, line: &str) -> io::Result<ExitStatus> {
        log::trace!("[{}] `{line}` (blocking)", self.name());
        self.ssh(&[line]).output().map(|o| o.status)
    }

    /// `ssh` invocation executing `args` on the host.
    fn ssh(&self, args: &[impl AsRef<str>]) -> StdCommand {
        let mut cmd = StdCommand::new("ssh");
        cmd.args(&self.options)
            .arg(&self.destination)
            .args(args.iter().map(AsRef::as_ref));
        cmd
    }

    /// Run the command to completion. The child is killed if the future is dropped.
    async fn run(&self, cmd: StdCommand, line: &str) -> Result<Output, SshError> {
        log::trace!("[{}] `{line}`", self.name());
        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd.output().await.map_err(|e| {
            log::error!("[{}] cannot execute `{line}`: {e}", self.name());
            SshError::Client(e)
        })
    }

    fn ensure_success(&self, command: String, output: Output) -> Result<Output, SshError> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::warn!(
            "[{}] `{command}` failed with {}\nSTDOUT:\n{}\nSTDERR:\n{stderr}",
            self.name(),
            output.status,
            String::from_utf8_lossy(&output.stdout).trim(),
        );
        Err(SshError::Command {
            host: self.destination.clone(),
            command,
            status: output.status,
            stderr,
        })
    }
}

/// Options shared by all `ssh` and `scp` invocations towards the host.
pub(crate) fn connection_options(host: &HostConfig) -> Vec<OsString> {
    let mut options: Vec<OsString> = [
        "-oControlMaster=auto",
        "-oControlPath=/tmp/.ssh-%r@%h:%p",
        "-oControlPersist=30m",
        "-oBatchMode=yes",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    if let Some(user) = &host.user {
        options.push(format!("-oUser={user}").into());
    }
    if let Some(key) = &host.identity_file {
        let mut option = OsString::from("-oIdentityFile=");
        option.push(key);
        options.push(option);
    }
    options
}

/// Quote an argument for the remote shell. Arguments made only of characters without meaning to
/// the shell are returned unchanged.
pub fn shell_quote(arg: &str) -> String {
    let plain = |c: char| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c);
    if !arg.is_empty() && arg.chars().all(plain) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Error of an [`SshSession`].
#[derive(Debug, Error)]
pub enum SshError {
    /// The host answered, but not as expected.
    #[error("Cannot set up the session with {host}: {reason}")]
    Setup {
        /// Destination of the session
        host: String,
        /// What went wrong
        reason: String,
    },
    /// The host did not answer in time.
    #[error("Timeout while connecting to {0}")]
    Timeout(String),
    /// The local `ssh` or `scp` process could not be executed.
    #[error("Cannot execute ssh: {0}")]
    Client(#[from] io::Error),
    /// A command exited with a non-zero status.
    #[error("`{command}` failed on {host} with {status}: {stderr}")]
    Command {
        /// Destination of the session
        host: String,
        /// The command line
        command: String,
        /// Exit status of the command (or of `ssh` itself)
        status: ExitStatus,
        /// Trimmed STDERR of the command
        stderr: String,
    },
    /// The output is not valid UTF-8.
    #[error("Cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}
