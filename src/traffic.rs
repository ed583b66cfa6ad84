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
//! Traffic sources of an experiment.
//!
//! A [`TrafficPattern`] is the declarative form read from the configuration. Bound to the rate and
//! the seed of one experiment, it becomes a [`TrafficSpec`], which knows how to start its server
//! and how to render its client as a job.

use std::{
    fmt::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tokio::time::{sleep, Instant};

use crate::{
    ccp,
    config::{Config, Scalar, BG_PORT_RANGE},
    experiments::{
        runner::{IterationEnv, IterationState},
        Rate,
    },
    jobs::Job,
    remote::{Connection, ProcessPattern, ReadinessCheck, ReadinessPolicy, RunOptions},
    util::PathBufExt,
    EvalError,
};

/// Reporting interval of iperf, in seconds.
const REPORT_INTERVAL: u32 = 1;
/// Fan-out of the empirical traffic generator.
const ETG_FANOUT: &str = "1 100";

/// Traffic source as written in the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TrafficPattern {
    Iperf {
        port: u16,
        flows: u32,
        length: u32,
        alg: String,
        start_delay: u32,
    },
    Poisson {
        conns: u32,
        backlogged: u32,
        reqs: u64,
        dist: String,
        load: Load,
        alg: String,
        start_delay: u32,
        /// First server port. Defaults to the start of the bundle port region.
        #[serde(default)]
        port_start: Option<u16>,
    },
    Cbr {
        port: u16,
        length: u32,
        rate: Scalar,
        start_delay: u32,
    },
}

/// Offered load as a fraction of the link rate. Written as a number or as a fraction `"1/2"`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "Scalar")]
pub struct Load(pub f64);

impl TryFrom<Scalar> for Load {
    type Error = String;

    fn try_from(value: Scalar) -> Result<Self, Self::Error> {
        let x = match value {
            Scalar::Int(x) => x as f64,
            Scalar::Float(x) => x,
            Scalar::Str(s) => match s.split_once('/') {
                Some((n, d)) => {
                    let n: f64 = n.trim().parse().map_err(|_| format!("invalid load {s:?}"))?;
                    let d: f64 = d.trim().parse().map_err(|_| format!("invalid load {s:?}"))?;
                    if d == 0.0 {
                        return Err(format!("invalid load {s:?}"));
                    }
                    n / d
                }
                None => s.trim().parse().map_err(|_| format!("invalid load {s:?}"))?,
            },
        };
        if x.is_finite() && x > 0.0 {
            Ok(Load(x))
        } else {
            Err(format!("load must be positive, got {x}"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IperfTraffic {
    pub port: u16,
    pub flows: u32,
    pub length: u32,
    pub alg: String,
    pub start_delay: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CbrTraffic {
    pub port: u16,
    pub length: u32,
    pub rate: Scalar,
    pub start_delay: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoissonTraffic {
    pub conns: u32,
    pub backlogged: u32,
    pub reqs: u64,
    pub dist: String,
    /// Offered load in Mbps.
    pub load: f64,
    pub alg: String,
    pub seed: u64,
    pub start_delay: u32,
    pub port_start: Option<u16>,
}

/// A traffic source bound to one experiment.
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficSpec {
    Iperf(IperfTraffic),
    Poisson(PoissonTraffic),
    Cbr(CbrTraffic),
}

impl fmt::Display for TrafficSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficSpec::Iperf(t) => write!(f, "iperf.{}.{}", t.alg, t.flows),
            TrafficSpec::Cbr(t) => write!(f, "cbr.{}", t.rate),
            TrafficSpec::Poisson(t) => write!(
                f,
                "poisson.{}.{}",
                t.dist.split('_').next().unwrap_or_default(),
                t.load
            ),
        }
    }
}

impl TrafficSpec {
    /// Bind the pattern to the rate and the seed of an experiment.
    pub fn from_pattern(pattern: &TrafficPattern, rate: Rate, seed: u64) -> Self {
        match pattern.clone() {
            TrafficPattern::Iperf {
                port,
                flows,
                length,
                alg,
                start_delay,
            } => TrafficSpec::Iperf(IperfTraffic {
                port,
                flows,
                length,
                alg,
                start_delay,
            }),
            TrafficPattern::Cbr {
                port,
                length,
                rate,
                start_delay,
            } => TrafficSpec::Cbr(CbrTraffic {
                port,
                length,
                rate,
                start_delay,
            }),
            TrafficPattern::Poisson {
                conns,
                backlogged,
                reqs,
                dist,
                load,
                alg,
                start_delay,
                port_start,
            } => TrafficSpec::Poisson(PoissonTraffic {
                conns,
                backlogged,
                reqs,
                dist,
                load: load.0 * rate.0,
                alg,
                seed,
                start_delay,
                port_start,
            }),
        }
    }

    /// Ports used by this source (inclusive bounds).
    pub fn ports(&self, bg_port_start: u16) -> (u16, u16) {
        match self {
            TrafficSpec::Iperf(t) => (t.port, t.port),
            TrafficSpec::Cbr(t) => (t.port, t.port),
            TrafficSpec::Poisson(t) => {
                let start = t.port_start.unwrap_or(bg_port_start);
                let end = start.saturating_add(t.conns.saturating_sub(1).min(u16::MAX as u32) as u16);
                (start, end)
            }
        }
    }

    /// Bundle traffic must use ports inside the region captured by the outbox, and cross traffic
    /// must stay outside of it.
    pub fn check_port_range(
        &self,
        in_bundle: bool,
        bg_port_start: u16,
        bg_port_end: u16,
    ) -> Result<(), EvalError> {
        if let TrafficSpec::Poisson(t) = self {
            if t.conns > BG_PORT_RANGE as u32 {
                return Err(EvalError::PortRange(format!(
                    "Poisson traffic ({self}) requests {} connections, more than the outbox port range ({bg_port_start}-{bg_port_end})",
                    t.conns
                )));
            }
        }
        let (lo, hi) = self.ports(bg_port_start);
        let inside = |p: u16| p >= bg_port_start && p <= bg_port_end;
        if in_bundle && !(inside(lo) && inside(hi)) {
            Err(EvalError::PortRange(format!(
                "Bundle traffic ({self}, ports {lo}-{hi}) is outside of bundle capture region! ({bg_port_start}-{bg_port_end})"
            )))
        } else if !in_bundle && (inside(lo) || inside(hi) || (lo < bg_port_start && hi > bg_port_end)) {
            Err(EvalError::PortRange(format!(
                "Cross traffic ({self}, ports {lo}-{hi}) is in bundle capture region! ({bg_port_start}-{bg_port_end})"
            )))
        } else {
            Ok(())
        }
    }

    /// Start the server side of the traffic on `node`, and wait until it is ready. Returns the
    /// path of its output.
    pub async fn start_server(
        &self,
        env: &IterationEnv<'_>,
        node: &Connection,
        state: &mut IterationState,
    ) -> Result<PathBuf, EvalError> {
        log::info!("[{}] Start {self} server", node.nickname());
        match self {
            TrafficSpec::Iperf(t) => {
                let out = env.iteration_dir.then(format!("iperf_server_{}.out", t.port));
                let iperf = &env.config.structure.iperf_path;
                let cmd = format!(
                    "{iperf} -s -p {} --reverse -i {REPORT_INTERVAL} -t {} -P {}",
                    t.port, t.length, t.flows
                );
                node.run(&cmd, &RunOptions::new().background().output(&out))
                    .await?
                    .expect(format!("Failed to start iperf server on {}", node.host()))?;
                state.register(node, &out);
                let check = ReadinessCheck::process(ProcessPattern::full(format!(
                    "{iperf} -s -p {}",
                    t.port
                )))
                .with_marker(&out, "Server listening on TCP port");
                node.wait_ready(&check, env.readiness).await?;
                Ok(out)
            }
            TrafficSpec::Cbr(t) => {
                let out = env.iteration_dir.then(format!("cbr_server_{}.out", t.port));
                let agent_out = env.iteration_dir.then("ccp_const.out");
                let agent = ccp::binary_path(env.config, "const")?;

                log::debug!("[{}] Starting CBR agent", node.nickname());
                node.run(
                    format!("{agent} --ipc=netlink --rate={}", t.rate),
                    &RunOptions::new().sudo().background().output(&agent_out),
                )
                .await?
                .expect("Failed to start ccp_const agent")?;
                state.register(node, &agent_out);

                let iperf = &env.config.structure.iperf_path;
                node.run(
                    format!(
                        "{iperf} -s -p {} --reverse -i {REPORT_INTERVAL} -t {} -Z ccp",
                        t.port, t.length
                    ),
                    &RunOptions::new().background().output(&out),
                )
                .await?
                .expect(format!("Failed to start iperf server on {}", node.host()))?;
                state.register(node, &out);

                let server = ReadinessCheck::process(ProcessPattern::full(format!(
                    "{iperf} -s -p {}",
                    t.port
                )))
                .with_marker(&out, "Server listening on TCP port");
                node.wait_ready(&server, env.readiness).await?;
                let agent = ReadinessCheck::process(ccp::process_pattern(env.config, "const")?)
                    .with_marker(&agent_out, "starting CCP Example");
                node.wait_ready(&agent, env.readiness).await?;
                Ok(out)
            }
            TrafficSpec::Poisson(t) => {
                let i = state.next_etg_server();
                let out = env.iteration_dir.then(format!("etg_server{i}.out"));
                let port_start = t.port_start.unwrap_or(env.config.parameters.bg_port_start);
                node.run(
                    format!(
                        "{} {port_start} {} {}",
                        env.config.structure.etg_server_path().display(),
                        t.conns,
                        t.alg
                    ),
                    &RunOptions::new()
                        .workdir(env.config.structure.etg_dir())
                        .background()
                        .output(&out),
                )
                .await?
                .expect(format!("Failed to start poisson servers on {}", node.host()))?;
                state.register(node, &out);
                let expected = state.expect_etg_servers(node, t.conns);
                wait_for_etg_servers(node, expected, &out, env.readiness).await?;
                Ok(out)
            }
        }
    }

    /// Prepare the client side of the traffic on `node`, connecting to `target`. The client is not
    /// started, but returned as a job to be launched by the topology.
    ///
    /// `target` may be a shell variable (like `$MAHIMAHI_BASE`) that is only known inside the
    /// environment in which the job runs.
    pub async fn client_job(
        &self,
        env: &IterationEnv<'_>,
        node: &Connection,
        target: &str,
        in_bundle: bool,
        state: &mut IterationState,
    ) -> Result<Job, EvalError> {
        log::info!("[{}] Prepare {self} client", node.nickname());
        let params = &env.config.parameters;
        self.check_port_range(in_bundle, params.bg_port_start, params.bg_port_end())?;
        let iperf = &env.config.structure.iperf_path;

        let (cmd, out) = match self {
            TrafficSpec::Iperf(t) => (
                format!(
                    "sleep {} && {iperf} -c {target} -p {} --reverse -i {REPORT_INTERVAL} -t {} -P {} -Z {}",
                    t.start_delay, t.port, t.length, t.flows, t.alg
                ),
                env.iteration_dir.then(format!("iperf_client_{}.out", t.port)),
            ),
            TrafficSpec::Cbr(t) => (
                format!(
                    "sleep {} && {iperf} -c {target} -p {} --reverse -i {REPORT_INTERVAL} -t {}",
                    t.start_delay, t.port, t.length
                ),
                env.iteration_dir.then(format!("cbr_client_{}.out", t.port)),
            ),
            TrafficSpec::Poisson(t) => {
                let i = state.next_etg_config();
                let config_name = format!("etgConfig{i}");
                let (addr, substitute) = match target.strip_prefix('$') {
                    Some(var) => (
                        format!("@{var}@"),
                        format!("sed -i \"s/@{var}@/${var}/g\" {config_name} && "),
                    ),
                    None => (target.to_string(), String::new()),
                };
                let content = t.etg_config(env.config, &addr);
                node.put(content, env.iteration_dir.then(&config_name)).await?;

                state.register(node, env.iteration_dir.then(format!("{i}_flows.out")));
                state.register(node, env.iteration_dir.then(format!("{i}_reqs.out")));

                // etgClient has a short buffer for file names, so use relative paths.
                (
                    format!(
                        "sleep {} && cd {} && {substitute}{} -c {config_name} -l {i} -s {}",
                        t.start_delay,
                        env.iteration_dir.display(),
                        env.config.structure.etg_client_path().display(),
                        t.seed
                    ),
                    env.iteration_dir.then(format!("etg_client{i}.out")),
                )
            }
        };
        state.register(node, &out);
        Ok(Job::background(format!("{cmd} > {} 2>&1", out.display())))
    }
}

impl PoissonTraffic {
    /// Configuration file of the empirical traffic generator client.
    pub fn etg_config(&self, config: &Config, server_addr: &str) -> String {
        let port_start = self.port_start.unwrap_or(config.parameters.bg_port_start) as u32;
        let mut s = String::new();
        for p in port_start..port_start + self.conns {
            let _ = writeln!(s, "server {server_addr} {p}");
        }
        let _ = writeln!(
            s,
            "req_size_dist {}",
            config.structure.distribution_dir().then(&self.dist).display()
        );
        let _ = writeln!(s, "fanout {ETG_FANOUT}");
        if self.backlogged > 0 {
            let _ = writeln!(s, "persistent_servers {}", self.backlogged);
        }
        let _ = writeln!(s, "load {}Mbps", self.load);
        let _ = writeln!(s, "num_reqs {}", self.reqs);
        s
    }
}

/// Wait until `expected` etgServer processes are running on the node.
async fn wait_for_etg_servers(
    node: &Connection,
    expected: u32,
    out: &Path,
    policy: &ReadinessPolicy,
) -> Result<(), EvalError> {
    if node.is_dry() {
        return Ok(());
    }
    let start = Instant::now();
    sleep(policy.settle).await;
    loop {
        let running: u32 = node
            .sh("pgrep -c etgServer")
            .await?
            .stdout
            .trim()
            .parse()
            .unwrap_or(0);
        if running == expected {
            return Ok(());
        }
        if start.elapsed() >= policy.timeout {
            return Err(EvalError::NotReady {
                host: node.host().to_string(),
                reason: format!(
                    "Traffic pattern requested {expected} servers, but only {running} are running properly."
                ),
                log_tail: node.tail(out, 20).await.unwrap_or_default(),
            });
        }
        sleep(policy.interval.max(Duration::from_millis(10))).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::test::EMULATED,
        remote::test::{recording, RecordingTransport},
    };

    fn iperf(port: u16) -> TrafficSpec {
        TrafficSpec::Iperf(IperfTraffic {
            port,
            flows: 2,
            length: 30,
            alg: "cubic".into(),
            start_delay: 0,
        })
    }

    fn poisson(port_start: Option<u16>, conns: u32) -> TrafficSpec {
        TrafficSpec::from_pattern(
            &TrafficPattern::Poisson {
                conns,
                backlogged: 2,
                reqs: 1000,
                dist: "CAIDA_CDF".into(),
                load: Load(0.5),
                alg: "reno".into(),
                start_delay: 5,
                port_start,
            },
            Rate(48.0),
            17,
        )
    }

    #[test]
    fn descriptors() {
        assert_eq!(iperf(5001).to_string(), "iperf.cubic.2");
        assert_eq!(poisson(None, 10).to_string(), "poisson.CAIDA.24");
        let cbr = TrafficSpec::Cbr(CbrTraffic {
            port: 4001,
            length: 30,
            rate: Scalar::Str("12Mbps".into()),
            start_delay: 0,
        });
        assert_eq!(cbr.to_string(), "cbr.12Mbps");
    }

    #[test]
    fn load_fractions() {
        assert_eq!(Load::try_from(Scalar::Str("1/2".into())), Ok(Load(0.5)));
        assert_eq!(Load::try_from(Scalar::Float(0.25)), Ok(Load(0.25)));
        assert!(Load::try_from(Scalar::Str("1/0".into())).is_err());
        assert!(Load::try_from(Scalar::Int(0)).is_err());
    }

    #[test]
    fn port_separation() {
        // bundle region is 5000-6000
        assert!(iperf(5001).check_port_range(true, 5000, 6000).is_ok());
        assert!(iperf(6000).check_port_range(true, 5000, 6000).is_ok());
        assert!(matches!(
            iperf(4001).check_port_range(true, 5000, 6000),
            Err(EvalError::PortRange(_))
        ));
        assert!(iperf(4001).check_port_range(false, 5000, 6000).is_ok());
        assert!(matches!(
            iperf(5500).check_port_range(false, 5000, 6000),
            Err(EvalError::PortRange(_))
        ));
        assert!(poisson(None, 100).check_port_range(true, 5000, 6000).is_ok());
        assert!(poisson(None, 100).check_port_range(false, 5000, 6000).is_err());
        assert!(poisson(Some(7000), 100).check_port_range(false, 5000, 6000).is_ok());
        assert!(poisson(Some(5990), 100).check_port_range(true, 5000, 6000).is_err());
        assert!(poisson(None, 1001).check_port_range(true, 5000, 6000).is_err());
    }

    #[test]
    fn etg_config_file() {
        let config = Config::parse(EMULATED).unwrap();
        let TrafficSpec::Poisson(t) = poisson(None, 2) else {
            unreachable!()
        };
        assert_eq!(
            t.etg_config(&config, "10.1.1.1"),
            "server 10.1.1.1 5000\nserver 10.1.1.1 5001\n\
             req_size_dist /tmp/bundler-eval/distributions/CAIDA_CDF\n\
             fanout 1 100\npersistent_servers 2\nload 24Mbps\nnum_reqs 1000\n"
        );
    }

    #[tokio::test]
    async fn deferred_client_is_a_job() {
        let config = Config::parse(EMULATED).unwrap();
        let policy = ReadinessPolicy::immediate();
        let dir = PathBuf::from("/exp/it");
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let node = recording("receiver", RecordingTransport::default());
        let mut state = IterationState::default();

        let job = iperf(5001)
            .client_job(&env, &node, "10.1.1.1", true, &mut state)
            .await
            .unwrap();
        assert_eq!(
            job,
            Job::background(
                "sleep 0 && iperf -c 10.1.1.1 -p 5001 --reverse -i 1 -t 30 -P 2 -Z cubic > /exp/it/iperf_client_5001.out 2>&1"
            )
        );
        // nothing was executed
        assert!(node.history().is_empty());
        assert_eq!(state.outputs().len(), 1);

        // poisson inside the emulator substitutes the base address at runtime
        let job = poisson(Some(7000), 1)
            .client_job(&env, &node, "$MAHIMAHI_BASE", false, &mut state)
            .await
            .unwrap();
        assert!(
            job.command
                .contains("sed -i \"s/@MAHIMAHI_BASE@/$MAHIMAHI_BASE/g\" etgConfig1 && "),
            "{}",
            job.command
        );
        assert_eq!(state.outputs().len(), 4);
    }

    #[tokio::test]
    async fn server_waits_for_listening() {
        let config = Config::parse(EMULATED).unwrap();
        let policy = ReadinessPolicy::immediate();
        let dir = PathBuf::from("/exp/it");
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let t = RecordingTransport::default()
            .respond("pgrep", 1, "")
            .respond("tail", 0, "bind failed: Address already in use\n");
        let node = recording("sender", t);
        let mut state = IterationState::default();
        let err = iperf(5001)
            .start_server(&env, &node, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::NotReady { .. }), "{err}");
        // the output is registered even though the server failed.
        assert_eq!(state.outputs().len(), 1);
    }

    #[tokio::test]
    async fn etg_servers_are_counted_per_host() {
        let config = Config::parse(EMULATED).unwrap();
        let policy = ReadinessPolicy::immediate();
        let dir = PathBuf::from("/exp/it");
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let sender = recording(
            "sender",
            RecordingTransport::default().respond("pgrep -c etgServer", 0, "10\n"),
        );
        let receiver = recording(
            "receiver",
            RecordingTransport::default().respond("pgrep -c etgServer", 0, "5\n"),
        );
        let mut state = IterationState::default();

        poisson(None, 10)
            .start_server(&env, &sender, &mut state)
            .await
            .unwrap();
        poisson(Some(7000), 5)
            .start_server(&env, &receiver, &mut state)
            .await
            .unwrap();

        // a second group on the same host adds up
        let err = poisson(Some(8000), 5)
            .start_server(&env, &receiver, &mut state)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, EvalError::NotReady { reason, .. } if reason.contains("requested 10 servers")),
            "{err}"
        );
    }
}
