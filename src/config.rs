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
//! Module for reading and checking the experiment configuration file.

use std::{collections::BTreeMap, fmt, net::Ipv4Addr, path::PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    experiments::{parse_traffic, sweep, Rate, BASELINE},
    topology::Role,
    traffic::{TrafficPattern, TrafficSpec},
    util::PathBufExt,
};

/// Number of ports in the region captured by the outbox.
pub const BG_PORT_RANGE: u16 = 1000;

/// Error thrown when the configuration is not valid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read the file
    #[error("Cannot read the config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML or does not match the expected structure.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A required key is missing or has the wrong shape.
    #[error("{0}")]
    Invalid(String),
    /// A value of an experiment axis is malformed.
    #[error("experiment.{axis}: {reason}")]
    Axis { axis: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn axis(axis: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Axis {
            axis: axis.into(),
            reason: reason.to_string(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub topology: TopologyConfig,
    pub parameters: Parameters,
    pub structure: Structure,
    /// Kernel parameters applied on every machine before any iteration.
    #[serde(default)]
    pub sysctl: toml::Table,
    /// Congestion control agents, by algorithm name.
    #[serde(default)]
    pub ccp: BTreeMap<String, CcpAlgConfig>,
    /// Request size distributions for poisson traffic (name -> local file).
    #[serde(default)]
    pub distributions: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// The sweep axes, in declaration order.
    pub experiment: toml::Table,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Outbox and receiver are the two ends of an emulated link.
    #[default]
    Emulated,
    /// All roles are separate machines.
    Cluster,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub mode: TopologyMode,
    pub sender: Option<RoleConfig>,
    pub inbox: Option<RoleConfig>,
    pub outbox: Option<RoleConfig>,
    pub receiver: Option<RoleConfig>,
    /// If present, the machines are provisioned live instead of being declared.
    pub cluster: Option<ClusterConfig>,
}

impl TopologyConfig {
    pub fn role(&self, role: Role) -> Option<&RoleConfig> {
        match role {
            Role::Sender => self.sender.as_ref(),
            Role::Inbox => self.inbox.as_ref(),
            Role::Outbox => self.outbox.as_ref(),
            Role::Receiver => self.receiver.as_ref(),
        }
    }

    /// Whether the cluster is provisioned live.
    pub fn is_provisioned(&self) -> bool {
        self.cluster.is_some()
    }
}

/// Machine bound to a role.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// The machine is the one running the orchestrator.
    #[serde(rename = "self", default)]
    pub is_self: bool,
    #[serde(default)]
    pub ifaces: Vec<IfaceConfig>,
    /// Only for the inbox: the port on which the inbox listens for the outbox.
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IfaceConfig {
    pub dev: String,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Command that prints one `ssh -p <port> <user>@<host>` line per machine. It is called with
    /// `existing` first, and with `launch` if no machines are reported.
    pub provision_command: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameters {
    pub initial_sample_rate: u32,
    pub bg_port_start: u16,
    /// Buffer size of the inbox queue.
    pub qdisc_buf_size: Scalar,
    /// Use the multi-queue ecmp discipline on the emulated link.
    pub ecmp: Option<EcmpConfig>,
}

impl Parameters {
    pub fn bg_port_end(&self) -> u16 {
        self.bg_port_start.saturating_add(BG_PORT_RANGE)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EcmpConfig {
    pub queues: u32,
    pub mean_jitter: u32,
    #[serde(default)]
    pub nonworkconserving: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Structure {
    /// Root directory for all experiments and code, on every machine.
    pub bundler_root: PathBuf,
    #[serde(default = "default_iperf_path")]
    pub iperf_path: String,
    pub etg_dir: Option<PathBuf>,
    /// Local command that parses the results after the sweep.
    pub parse_command: Option<String>,
}

fn default_iperf_path() -> String {
    "iperf".to_string()
}

impl Structure {
    pub fn box_root(&self) -> PathBuf {
        self.bundler_root.clone().then("bundler")
    }

    pub fn experiment_root(&self) -> PathBuf {
        self.bundler_root.clone().then("experiments")
    }

    pub fn ccp_dir(&self) -> PathBuf {
        self.bundler_root.clone().then("ccp")
    }

    pub fn distribution_dir(&self) -> PathBuf {
        self.bundler_root.clone().then("distributions")
    }

    pub fn etg_dir(&self) -> PathBuf {
        self.etg_dir
            .clone()
            .unwrap_or_else(|| self.bundler_root.clone().then("empirical-traffic-gen"))
    }

    pub fn etg_client_path(&self) -> PathBuf {
        self.etg_dir().then("bin/etgClient")
    }

    pub fn etg_server_path(&self) -> PathBuf {
        self.etg_dir().then("run-servers.py")
    }

    pub fn inbox_binary(&self) -> PathBuf {
        self.box_root().then("target/debug/inbox")
    }

    pub fn outbox_binary(&self) -> PathBuf {
        self.box_root().then("target/debug/outbox")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLanguage {
    Rust,
    Python,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CcpAlgConfig {
    pub repo: String,
    pub branch: String,
    /// Commit to check out, or `latest`.
    pub commit: String,
    pub language: AgentLanguage,
    /// Path of the binary (or script) relative to the checked-out repository.
    pub target: String,
    /// Default arguments, overwritten by the algorithm parameters of the experiment.
    #[serde(default)]
    pub args: toml::Table,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub webhook: Option<String>,
}

/// A scalar config value that may be written as a number or a string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(x) => write!(f, "{x}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

/// Render a TOML value the way it is passed on a command line (strings without quotes).
pub fn render_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(x) => x.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(xs) => xs.iter().map(render_value).collect::<Vec<_>>().join(","),
        toml::Value::Table(t) => toml::Value::Table(t.clone()).to_string(),
    }
}

impl Config {
    /// Read the config file and check it.
    pub fn read(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::info!("Reading config file: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        Ok(config)
    }

    /// Parse the config from a string and check it.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Check that the config contains everything necessary to run the experiments.
    pub fn check(&self) -> Result<(), ConfigError> {
        log::debug!("Checking config file");
        self.check_topology()?;

        for (k, v) in self.sysctl.iter() {
            if !v.is_str() {
                return Err(ConfigError::invalid(format!(
                    "sysctl.{k}: key names with dots must be enclosed in quotes, and values must be strings"
                )));
            }
        }

        for (name, ccp) in self.ccp.iter() {
            if ccp.target.is_empty() {
                return Err(ConfigError::invalid(format!("ccp.{name} is missing 'target'")));
            }
        }

        // every axis value must be well-formed.
        sweep::check_axes(&self.experiment)?;
        self.check_traffic()?;

        for alg in self.algorithms() {
            if alg != BASELINE && !self.ccp.contains_key(&alg) {
                return Err(ConfigError::invalid(format!(
                    "experiment.alg: no [ccp.{alg}] section for algorithm {alg}"
                )));
            }
        }

        Ok(())
    }

    /// Names of all algorithms in the sweep.
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .experiment
            .get("alg")
            .and_then(|a| a.as_array())
            .into_iter()
            .flatten()
            .filter_map(|a| a.get("name").and_then(|n| n.as_str()))
            .map(String::from)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Every traffic pattern of the sweep must respect the bundle port region, and constant
    /// bit-rate traffic needs the `const` agent.
    fn check_traffic(&self) -> Result<(), ConfigError> {
        let (start, end) = (self.parameters.bg_port_start, self.parameters.bg_port_end());
        for (axis, in_bundle) in [("bundle_traffic", true), ("cross_traffic", false)] {
            let values = self
                .experiment
                .get(axis)
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten();
            for v in values {
                for pattern in parse_traffic(axis, v)? {
                    if matches!(pattern, TrafficPattern::Cbr { .. }) && !self.ccp.contains_key("const") {
                        return Err(ConfigError::axis(
                            axis,
                            "cbr traffic requires a [ccp.const] section",
                        ));
                    }
                    // ports depend on neither the rate nor the seed
                    TrafficSpec::from_pattern(&pattern, Rate(1.0), 0)
                        .check_port_range(in_bundle, start, end)
                        .map_err(|e| ConfigError::axis(axis, e))?;
                }
            }
        }
        Ok(())
    }

    fn check_topology(&self) -> Result<(), ConfigError> {
        let topo = &self.topology;
        if topo.is_provisioned() {
            for role in Role::ALL {
                if topo.role(role).is_some() {
                    return Err(ConfigError::invalid(format!(
                        "Don't use key topology.{role} with a provisioned cluster; it will be auto-populated"
                    )));
                }
            }
            return Ok(());
        }

        for role in Role::ALL {
            let Some(node) = topo.role(role) else {
                return Err(ConfigError::invalid(format!("Missing key topology.{role}")));
            };
            if node.name.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "topology.{role} is missing 'name' key"
                )));
            }
            if node.ifaces.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "topology.{role} must have at least 1 interface"
                )));
            }
        }

        let Some(inbox) = topo.inbox.as_ref() else {
            return Err(ConfigError::invalid("Missing key topology.inbox"));
        };
        if topo.mode == TopologyMode::Emulated && inbox.ifaces.len() < 2 {
            return Err(ConfigError::invalid(
                "topology.inbox must have at least 2 interfaces",
            ));
        }
        if inbox.listen_port.is_none() {
            return Err(ConfigError::invalid("topology.inbox must define listen_port"));
        }

        let num_self = Role::ALL
            .iter()
            .filter_map(|r| topo.role(*r))
            .filter(|n| n.is_self)
            .count();
        match topo.mode {
            TopologyMode::Emulated if num_self == 0 => Err(ConfigError::invalid(
                "One node in topology section must be labeled with \"self = true\"",
            )),
            _ if num_self > 1 => Err(ConfigError::invalid(
                "Only one node in topology section can be labeled self",
            )),
            _ => Ok(()),
        }
    }
}
