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
//! Transport for the machine running the orchestrator.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use super::{RawOutput, RemoteError, Transport};
use crate::util::expand_home;

/// Executes commands with the local `bash`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

fn io_err(e: std::io::Error) -> RemoteError {
    RemoteError::Io("localhost".to_string(), e)
}

#[async_trait]
impl Transport for LocalTransport {
    fn is_local(&self) -> bool {
        true
    }

    async fn exec(&self, cmd: &str) -> Result<RawOutput, RemoteError> {
        let out = Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(io_err)?;
        Ok(out.into())
    }

    async fn upload(&self, content: &[u8], remote: &Path) -> Result<(), RemoteError> {
        tokio::fs::write(expand_home(remote), content)
            .await
            .map_err(|e| RemoteError::Transfer("localhost".to_string(), remote.to_path_buf(), e.to_string()))
    }

    async fn download(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        let (from, to) = (expand_home(remote), expand_home(local));
        if from == to {
            return Ok(());
        }
        tokio::fs::copy(&from, &to)
            .await
            .map(|_| ())
            .map_err(|e| RemoteError::Transfer("localhost".to_string(), remote.to_path_buf(), e.to_string()))
    }
}
