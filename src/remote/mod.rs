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
//! Connections to the machines of the topology.
//!
//! A [`Connection`] executes shell commands on a single host, either through ssh or locally. Every
//! command is composed by [`build_command`] from the raw command and its [`RunOptions`], such that
//! the exact command line that is sent to the host can be inspected and tested.

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{util::shell_quote, EvalError};

mod local;
mod readiness;
mod ssh;

pub use local::LocalTransport;
pub use readiness::{ProcessPattern, ReadinessCheck, ReadinessPolicy};
pub use ssh::SshTransport;

/// Error of the transport layer.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Cannot spawn the local process (ssh, scp or bash).
    #[error("[{0}] IO error: {1}")]
    Io(String, std::io::Error),
    /// Cannot establish the connection.
    #[error("[{0}] Cannot connect: {1}")]
    Connect(String, String),
    /// Cannot upload or download a file.
    #[error("[{0}] File transfer of {1:?} failed: {2}")]
    Transfer(String, PathBuf, String),
}

/// Output of a process, as returned by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for RawOutput {
    fn from(value: std::process::Output) -> Self {
        Self {
            code: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// The way commands reach a host.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Whether the commands are executed on the machine running the orchestrator.
    fn is_local(&self) -> bool;

    /// Execute the shell command and wait for its completion.
    async fn exec(&self, cmd: &str) -> Result<RawOutput, RemoteError>;

    /// Write `content` into the file at `remote`.
    async fn upload(&self, content: &[u8], remote: &Path) -> Result<(), RemoteError>;

    /// Copy the file at `remote` to the local path `local`.
    async fn download(&self, remote: &Path, local: &Path) -> Result<(), RemoteError>;
}

/// Result of a command executed on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub host: String,
    pub command: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// Synthetic output of a command that was not executed (dry run).
    fn dry(host: &str, command: String) -> Self {
        Self {
            host: host.to_string(),
            command,
            code: Some(0),
            stdout: "(dryrun)".to_string(),
            stderr: "(dryrun)".to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit code into an error.
    pub fn expect(self, context: impl Into<String>) -> Result<Self, EvalError> {
        if self.success() {
            Ok(self)
        } else {
            Err(EvalError::CommandFailed {
                context: context.into(),
                host: self.host,
                command: self.command,
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }

    /// Log a warning if the command failed, but continue.
    pub fn warn(self, context: impl AsRef<str>) -> Self {
        if !self.success() {
            log::warn!(
                "[{}] {}: `{}` exited with {:?}\n{}",
                self.host,
                context.as_ref(),
                self.command,
                self.code,
                self.stderr.trim()
            );
        }
        self
    }
}

/// Options of a single command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub sudo: bool,
    pub background: bool,
    pub workdir: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    /// Do not execute the command, even if the connection is not in dry-run mode.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn workdir(mut self, wd: impl Into<PathBuf>) -> Self {
        self.workdir = Some(wd.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Redirect both stdout and stderr into the same file.
    pub fn output(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.stdout(path.clone()).stderr(path)
    }

    pub fn dry_run(mut self, dry: bool) -> Self {
        self.dry_run = dry;
        self
    }
}

fn is_compound(cmd: &str) -> bool {
    ["&&", "||", ";", "|", "\n"].iter().any(|s| cmd.contains(s))
}

/// Compose the shell command line that is sent to the host.
///
/// Compound commands are wrapped in `bash -c` when they run with `sudo` or in the background, such
/// that the privileges and the detachment apply to the whole command. Background commands never
/// inherit the terminal: their input comes from `/dev/null`, and their output goes into the
/// requested files (or `/dev/null`).
pub fn build_command(cmd: &str, opts: &RunOptions) -> String {
    let mut body = if (opts.sudo || opts.background) && is_compound(cmd) {
        format!("bash -c {}", shell_quote(cmd))
    } else {
        cmd.to_string()
    };

    if opts.sudo {
        body = format!("sudo {body}");
    }
    if opts.background {
        body = format!("nohup {body}");
    }

    let redirect = match (&opts.stdout, &opts.stderr) {
        (Some(o), Some(e)) if o == e => format!(" > {} 2>&1", o.display()),
        (Some(o), Some(e)) => format!(" > {} 2> {}", o.display(), e.display()),
        (Some(o), None) if opts.background => format!(" > {} 2> /dev/null", o.display()),
        (Some(o), None) => format!(" > {}", o.display()),
        (None, Some(e)) if opts.background => format!(" > /dev/null 2> {}", e.display()),
        (None, Some(e)) => format!(" 2> {}", e.display()),
        (None, None) if opts.background => " > /dev/null 2>&1".to_string(),
        (None, None) => String::new(),
    };
    body.push_str(&redirect);

    if opts.background {
        body.push_str(" < /dev/null &");
    }

    match &opts.workdir {
        Some(wd) => format!("cd {} && {body}", wd.display()),
        None => body,
    }
}

struct Inner {
    host: String,
    nickname: String,
    transport: Box<dyn Transport>,
    dry: bool,
    verbose: bool,
    interact: AtomicBool,
    history: Mutex<Vec<String>>,
}

/// Handle to a single host. Cloning the connection is cheap, and all clones share the same
/// underlying transport.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.0.host)
            .field("nickname", &self.0.nickname)
            .field("transport", &self.0.transport)
            .field("dry", &self.0.dry)
            .finish()
    }
}

impl Connection {
    pub fn new(
        host: impl Into<String>,
        nickname: impl Into<String>,
        transport: impl Transport + 'static,
        dry: bool,
        verbose: bool,
    ) -> Self {
        Self(Arc::new(Inner {
            host: host.into(),
            nickname: nickname.into(),
            transport: Box::new(transport),
            dry,
            verbose,
            interact: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }))
    }

    /// Connection to the machine running the orchestrator.
    pub fn local(nickname: impl Into<String>, dry: bool, verbose: bool) -> Self {
        Self::new("localhost", nickname, LocalTransport, dry, verbose)
    }

    pub fn host(&self) -> &str {
        &self.0.host
    }

    pub fn nickname(&self) -> &str {
        &self.0.nickname
    }

    pub fn is_local(&self) -> bool {
        self.0.transport.is_local()
    }

    pub fn is_dry(&self) -> bool {
        self.0.dry
    }

    /// Whether two handles point to the same connection.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Ask for confirmation before each command.
    pub fn set_interact(&self, interact: bool) {
        self.0.interact.store(interact, Ordering::Relaxed);
    }

    /// All commands that were issued through this connection (and its clones).
    pub fn history(&self) -> Vec<String> {
        self.0
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn record(&self, cmd: &str, background: bool) {
        let prefix = if background { "(bg) " } else { "" };
        if self.0.verbose || self.0.dry {
            log::info!("[{:<10}] {prefix}{cmd}", self.0.nickname);
        } else {
            log::debug!("[{:<10}] {prefix}{cmd}", self.0.nickname);
        }
        if let Ok(mut h) = self.0.history.lock() {
            h.push(cmd.to_string());
        }
    }

    async fn confirm(&self, cmd: &str) -> Result<(), EvalError> {
        if !self.0.interact.load(Ordering::Relaxed) {
            return Ok(());
        }
        let prompt = format!("[{}] {cmd}\nPress Enter to run...", self.0.nickname);
        tokio::task::spawn_blocking(move || {
            println!("{prompt}");
            let mut buf = String::new();
            std::io::stdin().read_line(&mut buf).map(|_| ())
        })
        .await
        .map_err(|e| EvalError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }

    /// Execute a command on the host. A non-zero exit code is not an error; use
    /// [`CmdOutput::expect`] to require success.
    pub async fn run(&self, cmd: impl AsRef<str>, opts: &RunOptions) -> Result<CmdOutput, EvalError> {
        let command = build_command(cmd.as_ref(), opts);
        self.record(&command, opts.background);
        if self.0.dry || opts.dry_run {
            return Ok(CmdOutput::dry(&self.0.host, command));
        }
        self.confirm(&command).await?;
        let raw = self.0.transport.exec(&command).await?;
        log::trace!("[{:<10}] exit code: {:?}", self.0.nickname, raw.code);
        Ok(CmdOutput {
            host: self.0.host.clone(),
            command,
            code: raw.code,
            stdout: raw.stdout,
            stderr: raw.stderr,
        })
    }

    /// Shorthand for running a foreground command without options.
    pub async fn sh(&self, cmd: impl AsRef<str>) -> Result<CmdOutput, EvalError> {
        self.run(cmd, &RunOptions::new()).await
    }

    /// Check if a file exists on the host.
    pub async fn file_exists(&self, path: impl AsRef<Path>) -> Result<bool, EvalError> {
        let out = self
            .sh(format!("ls {}", path.as_ref().display()))
            .await?;
        Ok(out.success())
    }

    /// Check if a program is available in the `PATH` of the host.
    pub async fn prog_exists(&self, prog: impl AsRef<str>) -> Result<bool, EvalError> {
        let out = self.sh(format!("which {}", prog.as_ref())).await?;
        Ok(out.success())
    }

    /// Upload the content into a file on the host.
    pub async fn put(&self, content: impl AsRef<[u8]>, remote: impl AsRef<Path>) -> Result<(), EvalError> {
        let remote = remote.as_ref();
        self.record(&format!("put -> {}", remote.display()), false);
        if self.0.dry {
            return Ok(());
        }
        self.0.transport.upload(content.as_ref(), remote).await?;
        Ok(())
    }

    /// Download a file from the host.
    pub async fn get(&self, remote: impl AsRef<Path>, local: impl AsRef<Path>) -> Result<(), EvalError> {
        let (remote, local) = (remote.as_ref(), local.as_ref());
        self.record(
            &format!("get {} -> {}", remote.display(), local.display()),
            false,
        );
        if self.0.dry {
            return Ok(());
        }
        self.0.transport.download(remote, local).await?;
        Ok(())
    }

    /// Check whether a process matching the pattern is running.
    pub async fn check_proc(&self, process: &ProcessPattern) -> Result<bool, EvalError> {
        let out = self.sh(format!("pgrep {}", process.pgrep_args())).await?;
        Ok(out.success())
    }

    /// Check whether the file contains the given text.
    pub async fn check_file(&self, text: &str, path: impl AsRef<Path>) -> Result<bool, EvalError> {
        let out = self
            .sh(format!(
                "grep -F -q {} {}",
                shell_quote(text),
                path.as_ref().display()
            ))
            .await?;
        Ok(out.success())
    }

    /// Return the last lines of a file.
    pub async fn tail(&self, path: impl AsRef<Path>, lines: usize) -> Result<String, EvalError> {
        let out = self
            .sh(format!("tail -n {lines} {}", path.as_ref().display()))
            .await?;
        Ok(out.stdout)
    }

    /// Forcefully kill all processes matching the pattern.
    pub async fn kill(&self, process: &ProcessPattern) -> Result<CmdOutput, EvalError> {
        self.run(
            format!("pkill -9 {}", process.pgrep_args()),
            &RunOptions::new().sudo(),
        )
        .await
    }
}
