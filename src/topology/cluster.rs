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
//! Topology where every role is its own machine.
//!
//! ```text
//! sender --> inbox --> outbox --> receiver
//! ```
//!
//! Only the forward path is routed. Cross traffic enters through the inbox machine, such that it
//! traverses the same bottleneck as the bundle.

use std::{net::Ipv4Addr, str::FromStr};

use ipnet::Ipv4Net;

use super::{
    provision::{assign_roles, provision, Provisioner},
    route, Machines, NetworkInterface, Role, Topology,
};
use crate::{
    experiments::{
        runner::{IterationEnv, IterationState},
        ExperimentConfig,
    },
    jobs::JobList,
    remote::{Connection, RunOptions},
    util::PathBufExt,
    EvalError,
};

#[derive(Debug)]
pub struct ClusterTopology {
    pub(super) machines: Machines,
}

/// Parse the output of `ip -o -4 addr show`, keeping the interfaces with private addresses.
pub fn parse_interfaces(output: &str) -> Vec<NetworkInterface> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let _idx = words.next()?;
            let dev = words.next()?.trim_end_matches(':');
            if words.next()? != "inet" {
                return None;
            }
            let net = Ipv4Net::from_str(words.next()?).ok()?;
            let addr = net.addr();
            (addr.is_private() && !addr.is_loopback()).then(|| NetworkInterface {
                dev: dev.to_string(),
                addr,
            })
        })
        .collect()
}

/// Query the interfaces of a machine. Best-effort: failures only produce a warning.
async fn discover_interfaces(conn: &Connection, role: Role) -> Result<Vec<NetworkInterface>, EvalError> {
    if conn.is_dry() {
        log::info!("[{role}] (dryrun) using a placeholder interface");
        return Ok(vec![NetworkInterface {
            dev: format!("{role}0"),
            addr: Ipv4Addr::UNSPECIFIED,
        }]);
    }
    let out = conn.sh("ip -o -4 addr show").await?.warn("Interface discovery failed");
    let ifaces = parse_interfaces(&out.stdout);
    if ifaces.is_empty() {
        log::warn!("[{role}] no experiment interfaces found");
    }
    for iface in ifaces.iter() {
        log::debug!("[{role}] {} {}", iface.dev, iface.addr);
    }
    Ok(ifaces)
}

impl ClusterTopology {
    pub fn new(machines: Machines) -> Self {
        Self { machines }
    }

    /// Provision the machines, connect to them, and discover their interfaces.
    pub async fn provision(
        provisioner: &(impl Provisioner + ?Sized),
        listen_port: u16,
        dry: bool,
        verbose: bool,
    ) -> Result<Self, EvalError> {
        log::info!("Setup cluster topology");
        let machines = assign_roles(provision(provisioner).await?)?;
        let mut machines = Machines::connect(machines, listen_port, dry, verbose).await?;
        for role in Role::ALL {
            let ifaces = discover_interfaces(machines.conn(role), role).await?;
            machines.set_ifaces(role, ifaces);
        }
        Ok(Self::new(machines))
    }

    pub(super) async fn setup_routing(&self) -> Result<(), EvalError> {
        let m = &self.machines;
        let sender = m.addr(Role::Sender)?;
        let receiver = m.addr(Role::Receiver)?;
        let inbox = m.addr(Role::Inbox)?;
        let outbox = m.addr(Role::Outbox)?;

        route(
            m.conn(Role::Sender),
            format!("ip route del {receiver}; ip route add {receiver} via {inbox} src {sender}"),
            "Failed to set routing tables at sender",
        )
        .await?;
        route(
            m.conn(Role::Inbox),
            "sysctl net.ipv4.ip_forward=1".to_string(),
            "Failed to set IP forwarding at inbox",
        )
        .await?;
        route(
            m.conn(Role::Inbox),
            format!("ip route del {receiver}; ip route add {receiver} via {outbox}"),
            "Failed to set forward route at inbox",
        )
        .await?;
        route(
            m.conn(Role::Outbox),
            "sysctl net.ipv4.ip_forward=1".to_string(),
            "Failed to set IP forwarding at outbox",
        )
        .await
    }

    /// Start the outbox on its own machine, then run all clients as one script on the receiver
    /// and wait for it to finish.
    pub(super) async fn run_traffic(
        &self,
        topo: &Topology,
        env: &IterationEnv<'_>,
        exp: &ExperimentConfig,
        bundle: JobList,
        cross: JobList,
        state: &mut IterationState,
    ) -> Result<(), EvalError> {
        if !exp.alg.is_baseline() {
            let outbox = self.machines.conn(Role::Outbox);
            let out = env.iteration_dir.then("outbox.log");
            let iface = self.machines.iface(Role::Outbox, 0)?.dev.clone();
            log::info!("[{}] Starting outbox", outbox.nickname());
            outbox
                .run(
                    topo.outbox_command(env.config, &iface, false)?,
                    &RunOptions::new().sudo().background().output(&out),
                )
                .await?
                .expect("Failed to start outbox")?;
            state.register(outbox, &out);
        }

        let receiver = self.machines.conn(Role::Receiver);
        let mut jobs = JobList::new();
        jobs.extend(cross.jobs().iter().cloned());
        jobs.extend(bundle.jobs().iter().cloned());
        let script_path = env.iteration_dir.then("traffic.sh");
        let script = jobs.render_script();
        if receiver.is_dry() {
            log::info!("cat {}\n{script}", script_path.display());
        }
        receiver.put(script, &script_path).await?;

        log::info!(
            "[{}] Starting traffic, no emulation, waiting for {} clients",
            receiver.nickname(),
            jobs.num_waited()
        );
        receiver
            .run(
                format!("bash {}", script_path.display()),
                &RunOptions::new().workdir(env.iteration_dir),
            )
            .await?
            .expect("Failed to run traffic on receiver")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeMap, path::PathBuf, sync::atomic::AtomicUsize};

    use super::*;
    use crate::{
        config::{test::EMULATED, Config},
        experiments::sweep,
        jobs::Job,
        remote::{
            test::{recording, RecordingTransport},
            ReadinessPolicy,
        },
        topology::{provision::test::FakeProvisioner, provision::parse_ssh_urls, Machine},
    };

    const IP_ADDR: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eno1    inet 128.110.218.21/21 brd 128.110.223.255 scope global eno1\\       valid_lft forever preferred_lft forever
3: enp6s0f1    inet 10.10.1.2/24 brd 10.10.1.255 scope global enp6s0f1\\       valid_lft forever preferred_lft forever
";

    #[test]
    fn interfaces() {
        assert_eq!(
            parse_interfaces(IP_ADDR),
            vec![NetworkInterface {
                dev: "enp6s0f1".into(),
                addr: "10.10.1.2".parse().unwrap()
            }]
        );
    }

    fn cluster() -> Topology {
        let mut machines = BTreeMap::new();
        let mut conns = BTreeMap::new();
        for (i, role) in Role::ALL.into_iter().enumerate() {
            let name = format!("node{i}");
            machines.insert(
                role,
                Machine {
                    name: name.clone(),
                    user: None,
                    port: None,
                    is_self: false,
                    ifaces: vec![NetworkInterface {
                        dev: "eth1".into(),
                        addr: Ipv4Addr::new(10, 10, 1, i as u8 + 1),
                    }],
                },
            );
            conns.insert(role, recording(&role.to_string(), RecordingTransport::default()));
        }
        Topology::Cluster(ClusterTopology::new(Machines::new(machines, conns, 28316).unwrap()))
    }

    #[tokio::test]
    async fn cross_traffic_enters_at_the_inbox() {
        let topo = cluster();
        assert_eq!(
            topo.cross_source().unwrap(),
            (Role::Inbox, "10.10.1.2".to_string())
        );
        topo.setup_routing().await.unwrap();
        let inbox = topo.machines().conn(Role::Inbox).history();
        assert_eq!(inbox[1], "sudo bash -c 'ip route del 10.10.1.4; ip route add 10.10.1.4 via 10.10.1.3'");
    }

    #[tokio::test]
    async fn outbox_then_synchronous_script() {
        let config = Config::parse(EMULATED).unwrap();
        let topo = cluster();
        let exp = sweep::experiments(&config.experiment).unwrap().remove(0);
        let dir = PathBuf::from("/exp/it");
        let policy = ReadinessPolicy::immediate();
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let mut state = IterationState::default();
        let bundle: JobList = [Job::background("iperf -c 10.10.1.1 -p 5001")].into_iter().collect();
        topo.run_traffic(&env, &exp, bundle, JobList::new(), &mut state)
            .await
            .unwrap();

        let outbox = topo.machines().conn(Role::Outbox).history();
        assert!(outbox[0].starts_with("nohup sudo /tmp/bundler-eval/bundler/target/debug/outbox --filter"), "{}", outbox[0]);
        assert!(outbox[0].contains("--iface eth1 --inbox 10.10.1.2:28316"));
        assert!(!outbox[0].contains("--no_ethernet"));

        let receiver = topo.machines().conn(Role::Receiver).history();
        assert_eq!(receiver, vec!["put -> /exp/it/traffic.sh", "cd /exp/it && bash /exp/it/traffic.sh"]);
    }

    #[tokio::test]
    async fn provisioned_machines_are_discovered() {
        let p = FakeProvisioner {
            existing: parse_ssh_urls("ssh -p 22 a@x1\nssh -p 22 a@x2\nssh -p 22 a@x3"),
            launched: AtomicUsize::new(0),
        };
        // dry run: no ssh connection is opened, and placeholder interfaces are used.
        let topo = ClusterTopology::provision(&p, 28316, true, false).await.unwrap();
        assert_eq!(topo.machines.unique().len(), 3);
        assert_eq!(topo.machines.iface(Role::Outbox, 0).unwrap().dev, "outbox0");
    }
}
