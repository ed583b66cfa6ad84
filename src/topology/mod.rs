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
//! The four-role network topology.
//!
//! ```text
//! sender --> inbox --> outbox --> receiver
//! ```
//!
//! The inbox shapes all traffic towards the outbox, which reports measurements back to the inbox.
//! In the [`Emulated`](Topology::Emulated) variant, outbox and receiver live inside a link
//! emulator on the same machine. In the [`Cluster`](Topology::Cluster) variant, every role is
//! its own machine.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    path::PathBuf,
};

use crate::{
    config::{Config, ConfigError, RoleConfig, TopologyMode},
    experiments::{
        runner::{IterationEnv, IterationState},
        ExperimentConfig,
    },
    jobs::JobList,
    remote::{Connection, ProcessPattern, ReadinessCheck, RunOptions, SshTransport},
    util::PathBufExt,
    EvalError,
};

pub mod cluster;
pub mod emulated;
pub mod provision;

pub use cluster::ClusterTopology;
pub use emulated::EmulatedTopology;

/// Log marker of the inbox once it waits for the agent.
pub const INBOX_WAITING: &str = "Wait for CCP to install datapath program";
/// Log marker of the inbox once the agent has installed its datapath program.
pub const INBOX_READY: &str = "Inbox ready";

/// Logical role of a machine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Sender,
    Inbox,
    Outbox,
    Receiver,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Sender, Role::Inbox, Role::Outbox, Role::Receiver];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub dev: String,
    pub addr: Ipv4Addr,
}

/// A host of the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub is_self: bool,
    pub ifaces: Vec<NetworkInterface>,
}

impl From<&RoleConfig> for Machine {
    fn from(value: &RoleConfig) -> Self {
        Self {
            name: value.name.clone(),
            user: value.user.clone(),
            port: value.port,
            is_self: value.is_self,
            ifaces: value
                .ifaces
                .iter()
                .map(|i| NetworkInterface {
                    dev: i.dev.clone(),
                    addr: i.addr,
                })
                .collect(),
        }
    }
}

/// Machines bound to their roles, and the connections to them.
#[derive(Debug, Clone)]
pub struct Machines {
    machines: BTreeMap<Role, Machine>,
    conns: BTreeMap<Role, Connection>,
    /// One connection per distinct host.
    unique: Vec<Connection>,
    inbox_listen_port: u16,
}

impl Machines {
    /// Bind the machines to existing connections. Roles on the same host must share a connection.
    pub fn new(
        machines: BTreeMap<Role, Machine>,
        conns: BTreeMap<Role, Connection>,
        inbox_listen_port: u16,
    ) -> Result<Self, EvalError> {
        for role in Role::ALL {
            if !machines.contains_key(&role) || !conns.contains_key(&role) {
                return Err(ConfigError::invalid(format!("Missing machine for role {role}")).into());
            }
        }
        let mut unique: Vec<Connection> = Vec::new();
        for conn in conns.values() {
            if !unique.iter().any(|c| c.same(conn)) {
                unique.push(conn.clone());
            }
        }
        Ok(Self {
            machines,
            conns,
            unique,
            inbox_listen_port,
        })
    }

    /// Open a connection to every distinct host. The machine marked as `self` is reached locally.
    pub async fn connect(
        machines: BTreeMap<Role, Machine>,
        inbox_listen_port: u16,
        dry: bool,
        verbose: bool,
    ) -> Result<Self, EvalError> {
        log::info!("Creating SSH connections");
        let mut by_host: BTreeMap<String, Connection> = BTreeMap::new();
        let mut conns = BTreeMap::new();
        // connect the self machine first, such that roles sharing its host reuse the local one.
        let mut order: Vec<(&Role, &Machine)> = machines.iter().collect();
        order.sort_by_key(|(_, m)| !m.is_self);
        for (role, machine) in order {
            let conn = match by_host.get(&machine.name) {
                Some(conn) => conn.clone(),
                None => {
                    log::debug!("[{role}] {}", machine.name);
                    let conn = if machine.is_self {
                        Connection::local(role.to_string(), dry, verbose)
                    } else {
                        let transport = SshTransport::new(
                            machine.name.clone(),
                            machine.user.clone(),
                            machine.port,
                        );
                        if !dry {
                            transport.connect().await?;
                        }
                        Connection::new(machine.name.clone(), role.to_string(), transport, dry, verbose)
                    };
                    by_host.insert(machine.name.clone(), conn.clone());
                    conn
                }
            };
            conns.insert(*role, conn);
        }
        Self::new(machines, conns, inbox_listen_port)
    }

    pub fn conn(&self, role: Role) -> &Connection {
        &self.conns[&role]
    }

    pub fn machine(&self, role: Role) -> &Machine {
        &self.machines[&role]
    }

    /// Connections to all distinct hosts.
    pub fn unique(&self) -> &[Connection] {
        &self.unique
    }

    pub fn inbox_listen_port(&self) -> u16 {
        self.inbox_listen_port
    }

    /// Interface `idx` of the machine with the given role.
    pub fn iface(&self, role: Role, idx: usize) -> Result<&NetworkInterface, EvalError> {
        self.machine(role).ifaces.get(idx).ok_or_else(|| {
            ConfigError::invalid(format!(
                "topology.{role} has no interface with index {idx}"
            ))
            .into()
        })
    }

    /// Like [`Machines::iface`], but falls back to the last interface if there are fewer.
    pub fn iface_or_last(&self, role: Role, idx: usize) -> Result<&NetworkInterface, EvalError> {
        let ifaces = &self.machine(role).ifaces;
        ifaces
            .get(idx)
            .or_else(|| ifaces.last())
            .ok_or_else(|| ConfigError::invalid(format!("topology.{role} has no interfaces")).into())
    }

    pub fn addr(&self, role: Role) -> Result<Ipv4Addr, EvalError> {
        Ok(self.iface(role, 0)?.addr)
    }

    pub(crate) fn set_ifaces(&mut self, role: Role, ifaces: Vec<NetworkInterface>) {
        if let Some(m) = self.machines.get_mut(&role) {
            m.ifaces = ifaces;
        }
    }
}

/// Queue discipline of the emulated link.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueDiscipline {
    DropTail,
    /// Stochastic fair queueing with a fixed number of queues.
    FairQueue { queues: u32 },
    Ecmp(crate::config::EcmpConfig),
}

/// The topology of a run, in one of its two variants.
#[derive(Debug)]
pub enum Topology {
    Emulated(EmulatedTopology),
    Cluster(ClusterTopology),
}

impl Topology {
    /// Build the topology from the configuration, provisioning the cluster if necessary.
    pub async fn connect(config: &Config, dry: bool, verbose: bool) -> Result<Self, EvalError> {
        let topo = &config.topology;
        if let Some(cluster) = &topo.cluster {
            let provisioner = provision::CommandProvisioner::new(&cluster.provision_command, dry);
            let topo = ClusterTopology::provision(&provisioner, cluster.listen_port, dry, verbose).await?;
            return Ok(Topology::Cluster(topo));
        }

        let machines: BTreeMap<Role, Machine> = Role::ALL
            .iter()
            .filter_map(|r| topo.role(*r).map(|c| (*r, Machine::from(c))))
            .collect();
        let listen_port = topo
            .inbox
            .as_ref()
            .and_then(|i| i.listen_port)
            .ok_or_else(|| ConfigError::invalid("topology.inbox must define listen_port"))?;
        let machines = Machines::connect(machines, listen_port, dry, verbose).await?;
        Ok(match topo.mode {
            TopologyMode::Emulated => Topology::Emulated(EmulatedTopology::new(machines)),
            TopologyMode::Cluster => Topology::Cluster(ClusterTopology::new(machines)),
        })
    }

    pub fn machines(&self) -> &Machines {
        match self {
            Topology::Emulated(t) => &t.machines,
            Topology::Cluster(t) => &t.machines,
        }
    }

    pub fn is_emulated(&self) -> bool {
        matches!(self, Topology::Emulated(_))
    }

    /// Install the static routes of the variant.
    pub async fn setup_routing(&self) -> Result<(), EvalError> {
        log::info!("Setting up routing tables");
        match self {
            Topology::Emulated(t) => t.setup_routing().await,
            Topology::Cluster(t) => t.setup_routing().await,
        }
    }

    /// The machine serving cross traffic, and the address under which clients reach it.
    pub fn cross_source(&self) -> Result<(Role, String), EvalError> {
        match self {
            Topology::Emulated(_) => Ok((Role::Receiver, emulated::BASE_ADDR.to_string())),
            Topology::Cluster(t) => Ok((Role::Inbox, t.machines.addr(Role::Inbox)?.to_string())),
        }
    }

    /// Interface of the inbox facing the outbox.
    fn inbox_egress(&self) -> Result<&NetworkInterface, EvalError> {
        self.machines().iface_or_last(Role::Inbox, 1)
    }

    /// Start the shaper on the inbox, and wait until it waits for the agent. Returns the path of
    /// its log.
    pub async fn start_inbox_shaper(
        &self,
        env: &IterationEnv<'_>,
        qtype: &str,
        buffer: &str,
        state: &mut IterationState,
    ) -> Result<PathBuf, EvalError> {
        let inbox = self.machines().conn(Role::Inbox);
        log::info!("[{}] Starting inbox", inbox.nickname());
        let out = env.iteration_dir.then("inbox.log");
        let cmd = format!(
            "{} --iface={} --port={} --sample_rate={} --qtype={qtype} --buffer={buffer}",
            env.config.structure.inbox_binary().display(),
            self.inbox_egress()?.dev,
            self.machines().inbox_listen_port(),
            env.config.parameters.initial_sample_rate,
        );
        inbox
            .run(cmd, &RunOptions::new().sudo().background().output(&out))
            .await?
            .expect("Failed to start inbox")?;
        state.register(inbox, &out);

        let check = ReadinessCheck::process(ProcessPattern::exact("inbox")).with_marker(&out, INBOX_WAITING);
        inbox.wait_ready(&check, env.readiness).await?;
        Ok(out)
    }

    /// Command that starts the outbox, capturing the bundle port region on `iface`.
    pub fn outbox_command(&self, config: &Config, iface: &str, emulated: bool) -> Result<String, EvalError> {
        let params = &config.parameters;
        Ok(format!(
            "{} --filter \"src portrange {}-{}\" --iface {iface} --inbox {}:{} --sample_rate {}{}",
            config.structure.outbox_binary().display(),
            params.bg_port_start,
            params.bg_port_end(),
            self.inbox_egress()?.addr,
            self.machines().inbox_listen_port(),
            params.initial_sample_rate,
            if emulated { " --no_ethernet" } else { "" },
        ))
    }

    /// Launch the traffic and block until all clients have terminated.
    pub async fn run_traffic(
        &self,
        env: &IterationEnv<'_>,
        exp: &ExperimentConfig,
        bundle: JobList,
        cross: JobList,
        state: &mut IterationState,
    ) -> Result<(), EvalError> {
        match self {
            Topology::Emulated(t) => t.run_traffic(self, env, exp, bundle, cross, state).await,
            Topology::Cluster(t) => t.run_traffic(self, env, exp, bundle, cross, state).await,
        }
    }
}

/// Run a routing command with sudo, and fail if it does not succeed.
pub(crate) async fn route(conn: &Connection, cmd: String, context: &str) -> Result<(), EvalError> {
    conn.run(cmd, &RunOptions::new().sudo())
        .await?
        .expect(context)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::remote::test::{recording, RecordingTransport};

    /// Machines of the emulated test configuration, all reached through one recording connection
    /// per host.
    pub(crate) fn machines(config: &Config, transport: impl Fn() -> RecordingTransport) -> Machines {
        let mut by_host: BTreeMap<String, Connection> = BTreeMap::new();
        let mut machines = BTreeMap::new();
        let mut conns = BTreeMap::new();
        for role in Role::ALL {
            let m = Machine::from(config.topology.role(role).unwrap());
            let conn = by_host
                .entry(m.name.clone())
                .or_insert_with(|| recording(&role.to_string(), transport()))
                .clone();
            machines.insert(role, m);
            conns.insert(role, conn);
        }
        Machines::new(machines, conns, 28316).unwrap()
    }

    #[test]
    fn shared_hosts_share_connections() {
        let config = Config::parse(crate::config::test::EMULATED).unwrap();
        let m = machines(&config, RecordingTransport::default);
        assert_eq!(m.unique().len(), 3);
        assert!(m.conn(Role::Outbox).same(m.conn(Role::Receiver)));
        assert_eq!(m.iface(Role::Inbox, 1).unwrap().dev, "eth2");
        assert!(m.iface(Role::Sender, 1).is_err());
        assert_eq!(m.iface_or_last(Role::Sender, 1).unwrap().dev, "eth1");
    }

    #[test]
    fn role_names() {
        assert_eq!(Role::Receiver.to_string(), "receiver");
        assert_eq!("inbox".parse::<Role>().unwrap(), Role::Inbox);
    }
}
