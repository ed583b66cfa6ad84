// BundlerEval: Orchestration of Congestion-Control Experiments on Emulated and Physical Networks
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Transport over a multiplexed ssh master connection.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

use super::{RawOutput, RemoteError, Transport};

/// Commands are sent through `ssh`, reusing one master connection per host.
#[derive(Debug)]
pub struct SshTransport {
    host: String,
    user: Option<String>,
    port: Option<u16>,
    /// Whether a master connection was opened that must be closed.
    connected: AtomicBool,
}

impl SshTransport {
    pub fn new(host: impl Into<String>, user: Option<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            user,
            port,
            connected: AtomicBool::new(false),
        }
    }

    /// Destination in the form `user@host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn control_path() -> &'static str {
        "/tmp/bundler-eval-%r@%h:%p"
    }

    fn options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", Self::control_path()),
            "-o".to_string(),
            "ControlPersist=30m".to_string(),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args
    }

    fn ssh(&self) -> Command {
        self.connected.store(true, Ordering::Relaxed);
        let mut cmd = Command::new("ssh");
        cmd.args(self.options())
            .arg(self.destination())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn io_err(&self, e: std::io::Error) -> RemoteError {
        RemoteError::Io(self.host.clone(), e)
    }

    /// Open the master connection. Fails if the host cannot be reached.
    pub async fn connect(&self) -> Result<(), RemoteError> {
        log::debug!("[{}] connecting", self.host);
        let out = self
            .ssh()
            .arg("true")
            .output()
            .await
            .map_err(|e| self.io_err(e))?;
        if !out.status.success() {
            return Err(RemoteError::Connect(
                self.host.clone(),
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// `scp` does not expand `~`, but treats relative paths relative to the home directory.
fn strip_home(path: &Path) -> PathBuf {
    path.strip_prefix("~").map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

#[async_trait]
impl Transport for SshTransport {
    fn is_local(&self) -> bool {
        false
    }

    async fn exec(&self, cmd: &str) -> Result<RawOutput, RemoteError> {
        let out = self
            .ssh()
            .arg(cmd)
            .output()
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(out.into())
    }

    async fn upload(&self, content: &[u8], remote: &Path) -> Result<(), RemoteError> {
        let mut child = self
            .ssh()
            .arg(format!("cat > {}", remote.display()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.io_err(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content).await.map_err(|e| self.io_err(e))?;
        }
        let out = child.wait_with_output().await.map_err(|e| self.io_err(e))?;
        if !out.status.success() {
            return Err(RemoteError::Transfer(
                self.host.clone(),
                remote.to_path_buf(),
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn download(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        let mut cmd = Command::new("scp");
        cmd.args(["-q", "-o", "BatchMode=yes", "-o"])
            .arg(format!("ControlPath={}", Self::control_path()));
        if let Some(port) = self.port {
            cmd.arg("-P").arg(port.to_string());
        }
        let out = cmd
            .arg(format!("{}:{}", self.destination(), strip_home(remote).display()))
            .arg(local)
            .output()
            .await
            .map_err(|e| self.io_err(e))?;
        if !out.status.success() {
            return Err(RemoteError::Transfer(
                self.host.clone(),
                remote.to_path_buf(),
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        log::trace!("[{}] closing the master connection (drop)", self.host);
        let mut cmd = std::process::Command::new("ssh");
        cmd.args(["-O", "exit", "-o"])
            .arg(format!("ControlPath={}", Self::control_path()));
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        let _ = cmd
            .arg(self.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn destination() {
        let t = SshTransport::new("c220g1.wisc.cloudlab.us", Some("eval".into()), Some(22));
        assert_eq!(t.destination(), "eval@c220g1.wisc.cloudlab.us");
        assert!(t.options().ends_with(&["-p".to_string(), "22".to_string()]));
    }

    #[test]
    fn home_is_stripped_for_scp() {
        assert_eq!(
            strip_home(Path::new("~/bundler/exp/inbox.log")),
            PathBuf::from("bundler/exp/inbox.log")
        );
        assert_eq!(strip_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
