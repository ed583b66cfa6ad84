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
//! Readiness checks of long-running processes (shaper, agent, traffic servers).

use std::{path::PathBuf, time::Duration};

use tokio::time::{sleep, Instant};

use super::Connection;
use crate::{util::shell_quote, EvalError};

/// Number of log lines reported when a process does not become ready.
const LOG_TAIL_LINES: usize = 20;

/// Pattern to find a process with `pgrep` and `pkill`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessPattern {
    pub name: String,
    /// Match against the full command line instead of the process name.
    pub full: bool,
}

impl ProcessPattern {
    /// Match the exact process name.
    pub fn exact(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full: false,
        }
    }

    /// Match anywhere in the full command line.
    pub fn full(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full: true,
        }
    }

    /// Arguments for `pgrep` or `pkill`. Full patterns are written as `[n]ame` such that they
    /// never match the shell that runs `pgrep` itself.
    pub fn pgrep_args(&self) -> String {
        if self.full {
            let mut chars = self.name.chars();
            let pattern = match chars.next() {
                Some(c) => format!("[{c}]{}", chars.as_str()),
                None => String::new(),
            };
            format!("-f {}", shell_quote(pattern))
        } else {
            format!("-x {}", shell_quote(&self.name))
        }
    }
}

impl std::fmt::Display for ProcessPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// What it means for a process to be ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub process: Option<ProcessPattern>,
    pub log: Option<PathBuf>,
    pub marker: Option<String>,
}

impl ReadinessCheck {
    /// The process must be running.
    pub fn process(process: ProcessPattern) -> Self {
        Self {
            process: Some(process),
            log: None,
            marker: None,
        }
    }

    /// Additionally require `marker` to be present in the `log` file.
    pub fn with_marker(mut self, log: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self.marker = Some(marker.into());
        self
    }
}

/// Timing of readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Initial wait after starting the process.
    pub settle: Duration,
    /// Time between two polls.
    pub interval: Duration,
    /// Maximum time to wait (including the settle time).
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ReadinessPolicy {
    /// Policy that does not wait at all, and only checks once.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }
}

impl Connection {
    /// Wait until the process is running and its log contains the marker. Fails after the timeout
    /// of the policy, reporting the last lines of the log. Always ready in dry-run mode.
    pub async fn wait_ready(
        &self,
        check: &ReadinessCheck,
        policy: &ReadinessPolicy,
    ) -> Result<(), EvalError> {
        if self.is_dry() {
            log::debug!("[{}] (dryrun) assuming {:?} is ready", self.nickname(), check.process);
            return Ok(());
        }

        let start = Instant::now();
        sleep(policy.settle).await;

        loop {
            let proc_ok = match &check.process {
                Some(p) => self.check_proc(p).await?,
                None => true,
            };
            let log_ok = match (&check.log, &check.marker) {
                (Some(log), Some(marker)) => self.check_file(marker, log).await?,
                _ => true,
            };
            if proc_ok && log_ok {
                log::debug!(
                    "[{}] ready after {:?}",
                    self.nickname(),
                    start.elapsed()
                );
                return Ok(());
            }

            if start.elapsed() >= policy.timeout {
                let reason = if !proc_ok {
                    format!(
                        "process `{}` is not running",
                        check.process.as_ref().map(|p| p.name.as_str()).unwrap_or_default()
                    )
                } else {
                    format!(
                        "{:?} does not contain \"{}\"",
                        check.log.as_deref().unwrap_or_else(|| std::path::Path::new("")),
                        check.marker.as_deref().unwrap_or_default()
                    )
                };
                let log_tail = match &check.log {
                    Some(log) => self.tail(log, LOG_TAIL_LINES).await.unwrap_or_default(),
                    None => String::new(),
                };
                log::error!("[{}] {reason}", self.nickname());
                return Err(EvalError::NotReady {
                    host: self.host().to_string(),
                    reason,
                    log_tail,
                });
            }

            sleep(policy.interval).await;
        }
    }
}
