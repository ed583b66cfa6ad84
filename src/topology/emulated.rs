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
//! Topology where outbox and receiver are two ends of an emulated link.
//!
//! ```text
//! sender --> inbox --> (mm-delay/mm-link --> outbox   )
//!                      (                \            )
//!                      (                 -> receiver )
//! ```
//!
//! All clients run inside a single emulator shell, such that every flow experiences the same
//! emulated link. Cross traffic is served by the receiver host from outside the emulator.

use super::{route, Machines, QueueDiscipline, Role, Topology};
use crate::{
    config::EcmpConfig,
    experiments::{
        runner::{IterationEnv, IterationState},
        BufferSize, ExperimentConfig, Rate,
    },
    jobs::{Job, JobList},
    remote::RunOptions,
    util::PathBufExt,
    EvalError,
};

/// Address of the host as seen from within the emulator.
pub const BASE_ADDR: &str = "$MAHIMAHI_BASE";
/// Average packet size used to convert the buffer size into packets.
const PACKET_SIZE: f64 = 1500.0;
/// Number of queues of the fair queueing discipline.
const FAIR_QUEUES: u32 = 500;
/// Name of the ingress interface of the emulator.
const INGRESS: &str = "ingress";

#[derive(Debug)]
pub struct EmulatedTopology {
    pub(super) machines: Machines,
}

/// Parameters of the emulated link of one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub rate: Rate,
    /// Round-trip time in milliseconds.
    pub rtt: u32,
    pub bdp: BufferSize,
    pub queue: QueueDiscipline,
}

impl LinkConfig {
    pub fn new(exp: &ExperimentConfig, ecmp: Option<&EcmpConfig>) -> Self {
        let queue = match ecmp {
            Some(ecmp) => QueueDiscipline::Ecmp(ecmp.clone()),
            None if exp.alg.is_baseline() && exp.sch == "sfq" => QueueDiscipline::FairQueue {
                queues: FAIR_QUEUES,
            },
            None => QueueDiscipline::DropTail,
        };
        Self {
            rate: exp.rate,
            rtt: exp.rtt.0,
            bdp: exp.bdp,
            queue,
        }
    }

    /// Queue size in packets, or `None` for an unbounded queue.
    pub fn buffer_packets(&self) -> Option<u64> {
        match self.bdp {
            BufferSize::Infinite => None,
            BufferSize::Bdp(num_bdp) => {
                let one_way = self.rtt as f64 / 2.0 / 1000.0;
                let bytes = num_bdp * self.rate.bytes_per_sec() * one_way;
                Some(((bytes / PACKET_SIZE).floor() as u64).max(1))
            }
        }
    }

    /// Queue arguments of `mm-link`.
    pub fn queue_args(&self) -> String {
        let Some(buf) = self.buffer_packets() else {
            return String::new();
        };
        let (downlink, downlink_args) = match &self.queue {
            QueueDiscipline::DropTail => ("droptail", format!("packets={buf}")),
            QueueDiscipline::FairQueue { queues } => {
                ("akshayfq", format!("queues={queues},packets={buf}"))
            }
            QueueDiscipline::Ecmp(e) => (
                "ecmp",
                format!(
                    "packets={buf},queues={},mean_jitter={},nonworkconserving={}",
                    e.queues,
                    e.mean_jitter,
                    u8::from(e.nonworkconserving)
                ),
            ),
        };
        format!(
            "--downlink-queue={downlink} --downlink-queue-args=\"{downlink_args}\" \
             --uplink-queue=droptail --uplink-queue-args=\"packets={buf}\""
        )
    }

    /// Command that runs `inner` within the emulated link.
    pub fn command(&self, inner: &str) -> String {
        let queue_args = self.queue_args();
        let queue_args = if queue_args.is_empty() {
            String::new()
        } else {
            format!("{queue_args} ")
        };
        format!(
            "mm-delay {} mm-link --cbr {rate}M {rate}M {queue_args}--downlink-log=downlink.log {inner}",
            self.rtt / 2,
            rate = self.rate.0,
        )
    }
}

impl EmulatedTopology {
    pub fn new(machines: Machines) -> Self {
        Self { machines }
    }

    pub(super) async fn setup_routing(&self) -> Result<(), EvalError> {
        let m = &self.machines;
        let sender = m.addr(Role::Sender)?;
        let receiver = m.addr(Role::Receiver)?;
        let inbox_in = m.iface(Role::Inbox, 0)?;
        let inbox_out = m.iface(Role::Inbox, 1)?;

        route(
            m.conn(Role::Sender),
            format!("ip route del {receiver}; ip route add {receiver} via {} src {sender}", inbox_in.addr),
            "Failed to set routing tables at sender",
        )
        .await?;

        let inbox = m.conn(Role::Inbox);
        route(inbox, "sysctl net.ipv4.ip_forward=1".to_string(), "Failed to set IP forwarding at inbox").await?;
        route(
            inbox,
            format!("ip route del {receiver}; ip route add {receiver} dev {}", inbox_out.dev),
            "Failed to set forward route at inbox",
        )
        .await?;
        route(
            inbox,
            format!("ip route del {sender}; ip route add {sender} dev {}", inbox_in.dev),
            "Failed to set reverse route at inbox",
        )
        .await?;

        route(
            m.conn(Role::Outbox),
            format!("ip route del {sender}; ip route add {sender} via {}", inbox_out.addr),
            "Failed to set routing tables at outbox",
        )
        .await
    }

    /// Write the inner script (outbox and clients) to the receiver, and run it within the
    /// emulated link. Returns once every client has terminated.
    pub(super) async fn run_traffic(
        &self,
        topo: &Topology,
        env: &IterationEnv<'_>,
        exp: &ExperimentConfig,
        bundle: JobList,
        cross: JobList,
        state: &mut IterationState,
    ) -> Result<(), EvalError> {
        let receiver = self.machines.conn(Role::Receiver);
        let outbox_out = env.iteration_dir.then("outbox.log");

        let mut jobs = JobList::new();
        if !exp.alg.is_baseline() {
            let outbox = topo.outbox_command(env.config, INGRESS, true)?;
            jobs.push(Job::detached(format!("sudo {outbox} > {} 2>&1", outbox_out.display())));
            state.register(receiver, &outbox_out);
        }
        jobs.push(Job::foreground("sleep 1"));
        jobs.extend(cross.jobs().iter().cloned());
        jobs.extend(bundle.jobs().iter().cloned());

        let inner = env.iteration_dir.then("mm_inner.sh");
        let script = jobs.render_script();
        if receiver.is_dry() {
            log::info!("cat {}\n{script}", inner.display());
        }
        receiver.put(script, &inner).await?;
        receiver
            .sh(format!("chmod +x {}", inner.display()))
            .await?
            .expect("Failed to make the emulator script executable")?;

        let link = LinkConfig::new(exp, env.config.parameters.ecmp.as_ref());
        log::info!(
            "[{}] Starting traffic in emulated link, waiting for {} clients",
            receiver.nickname(),
            jobs.num_waited()
        );
        state.register(receiver, env.iteration_dir.then("downlink.log"));
        receiver
            .run(
                link.command(&inner.display().to_string()),
                &RunOptions::new().workdir(env.iteration_dir),
            )
            .await?
            .expect("Failed to start mahimahi shell on receiver")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{test::EMULATED, Config},
        experiments::{sweep, Rate, Rtt},
        remote::{test::RecordingTransport, ReadinessPolicy},
        topology::test::machines,
    };

    fn experiment(alg: &str, sch: &str) -> ExperimentConfig {
        let config = Config::parse(EMULATED).unwrap();
        let mut exp = sweep::experiments(&config.experiment).unwrap().remove(0);
        exp.alg.name = alg.to_string();
        exp.alg.params.clear();
        exp.sch = sch.to_string();
        exp
    }

    #[test]
    fn buffer_in_packets() {
        let exp = experiment("nimbus", "fifo");
        assert_eq!(exp.rate, Rate(48.0));
        assert_eq!(exp.rtt, Rtt(50));
        let link = LinkConfig::new(&exp, None);
        // 2 * 6 MB/s * 25 ms / 1500 B
        assert_eq!(link.buffer_packets(), Some(200));
        assert_eq!(
            link.command("/exp/mm_inner.sh"),
            "mm-delay 25 mm-link --cbr 48M 48M --downlink-queue=droptail --downlink-queue-args=\"packets=200\" \
             --uplink-queue=droptail --uplink-queue-args=\"packets=200\" --downlink-log=downlink.log /exp/mm_inner.sh"
        );
    }

    #[test]
    fn queue_disciplines() {
        let sfq = LinkConfig::new(&experiment("nobundler", "sfq"), None);
        assert_eq!(sfq.queue, QueueDiscipline::FairQueue { queues: 500 });
        assert!(sfq.queue_args().contains("--downlink-queue=akshayfq --downlink-queue-args=\"queues=500,packets=200\""));

        // the fair queue is only used for the baseline
        let fifo = LinkConfig::new(&experiment("nimbus", "sfq"), None);
        assert_eq!(fifo.queue, QueueDiscipline::DropTail);

        let ecmp = EcmpConfig {
            queues: 4,
            mean_jitter: 10,
            nonworkconserving: true,
        };
        let link = LinkConfig::new(&experiment("nimbus", "fifo"), Some(&ecmp));
        assert!(link
            .queue_args()
            .contains("packets=200,queues=4,mean_jitter=10,nonworkconserving=1"));

        let mut exp = experiment("nimbus", "fifo");
        exp.bdp = BufferSize::Infinite;
        let link = LinkConfig::new(&exp, None);
        assert_eq!(link.queue_args(), "");
        assert_eq!(
            link.command("inner.sh"),
            "mm-delay 25 mm-link --cbr 48M 48M --downlink-log=downlink.log inner.sh"
        );
    }

    #[tokio::test]
    async fn routing_commands() {
        let config = Config::parse(EMULATED).unwrap();
        let m = machines(&config, RecordingTransport::default);
        let topo = Topology::Emulated(EmulatedTopology::new(m));
        topo.setup_routing().await.unwrap();
        let sender = topo.machines().conn(Role::Sender).history();
        assert_eq!(
            sender,
            vec!["sudo bash -c 'ip route del 10.1.2.3; ip route add 10.1.2.3 via 10.1.1.2 src 10.1.1.1'"]
        );
        let inbox = topo.machines().conn(Role::Inbox).history();
        assert_eq!(inbox.len(), 3);
        assert!(inbox[1].contains("ip route add 10.1.2.3 dev eth2"));
        let outbox = topo.machines().conn(Role::Outbox).history();
        assert!(outbox[0].contains("ip route add 10.1.1.1 via 10.1.2.2"));
    }

    #[tokio::test]
    async fn traffic_runs_inside_the_emulator() {
        let config = Config::parse(EMULATED).unwrap();
        let m = machines(&config, RecordingTransport::default);
        let topo = Topology::Emulated(EmulatedTopology::new(m));
        let exp = experiment("nimbus", "fifo");
        let dir = std::path::PathBuf::from("/exp/it");
        let policy = ReadinessPolicy::immediate();
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let mut state = IterationState::default();
        let bundle: JobList = [Job::background("iperf -c 10.1.1.1 -p 5001 > out 2>&1")].into_iter().collect();

        topo.run_traffic(&env, &exp, bundle, JobList::new(), &mut state)
            .await
            .unwrap();

        let history = topo.machines().conn(Role::Receiver).history();
        assert_eq!(history[0], "put -> /exp/it/mm_inner.sh");
        assert_eq!(history[1], "chmod +x /exp/it/mm_inner.sh");
        assert!(history[2].starts_with("cd /exp/it && mm-delay 25 mm-link"), "{}", history[2]);
        assert!(history[2].ends_with("/exp/it/mm_inner.sh"));
        let outputs: Vec<_> = state.outputs().iter().map(|(_, p)| p.display().to_string()).collect();
        assert_eq!(outputs, vec!["/exp/it/outbox.log", "/exp/it/downlink.log"]);
    }
}
