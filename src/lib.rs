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
//! Library for orchestrating congestion-control experiments on a four-role network topology
//! (sender, inbox, outbox, receiver), either on an emulated link or on a real cluster.
use std::path::PathBuf;

use thiserror::Error;

pub mod ccp;
pub mod config;
pub mod experiments;
pub mod jobs;
pub mod remote;
pub mod topology;
pub mod traffic;
pub mod util;

/// Errors that abort the whole sweep.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The configuration file is malformed or incomplete.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    /// The remote transport failed (could not spawn the command, or transfer a file).
    #[error("Remote error: {0}")]
    Remote(#[from] remote::RemoteError),
    /// A required command exited with a non-zero exit code.
    #[error("{context}\n[{host}] exit code: {code:?}\ncommand: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    CommandFailed {
        context: String,
        host: String,
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// A process did not come up properly.
    #[error("[{host}] {reason}\n{log_tail}")]
    NotReady {
        host: String,
        reason: String,
        log_tail: String,
    },
    /// The same iteration directory was prepared twice within one run.
    #[error("Iteration directory {0:?} not reset! This must be a bug.")]
    IterationNotReset(PathBuf),
    /// Results exist already, and no policy was given how to treat them.
    #[error("Found existing results at {0:?}, but unsure how to handle them. Please provide --skip-existing or --overwrite-existing")]
    ExistingResults(PathBuf),
    /// Both skip and overwrite were requested.
    #[error("--skip-existing and --overwrite-existing cannot be used together")]
    ConflictingPolicy,
    /// A program required by the experiments is not installed.
    #[error("[{host}] {program} is not installed")]
    MissingProgram { host: String, program: String },
    /// A process survived the forced teardown.
    #[error("[{host}] process `{pattern}` is still running after killing it")]
    LeftoverProcess { host: String, pattern: String },
    /// A traffic pattern uses ports in the wrong region.
    #[error("{0}")]
    PortRange(String),
    /// The cluster could not be provisioned.
    #[error("Cannot provision the cluster: {0}")]
    Provision(String),
    /// No `[ccp.<name>]` section exists for an algorithm.
    #[error("Unknown congestion control algorithm `{0}`, add a [ccp.{0}] section")]
    UnknownAlgorithm(String),
    /// Local IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub mod prelude {
    pub use super::{
        config::Config,
        experiments::{
            runner::{IterationOutcome, IterationRunner, RunContext, RunFlags},
            sweep::enumerate,
            ExperimentConfig,
        },
        remote::{Connection, RunOptions},
        topology::{Role, Topology},
        traffic::TrafficSpec,
        EvalError,
    };
}
