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
//! Preparation of the machines and directories before the sweep, and the teardown between
//! iterations.

use std::{
    collections::{BTreeMap, HashSet},
    io::Write,
    path::PathBuf,
};

use serde::Deserialize;

use super::runner::{IterationEnv, IterationState, RunContext};
use crate::{
    ccp,
    config::Config,
    remote::{Connection, ProcessPattern, RunOptions},
    topology::Role,
    traffic::TrafficPattern,
    util::{expand_home, shell_quote, PathBufExt},
    EvalError,
};

/// Disable segmentation and receive offloads on every interface of the topology. Failures are
/// only reported.
pub async fn disable_offloads(ctx: &RunContext) -> Result<(), EvalError> {
    log::info!("Turn off TSO, GSO, and GRO");
    let machines = ctx.topology.machines();
    let mut done = HashSet::new();
    for role in Role::ALL {
        let conn = machines.conn(role);
        for iface in machines.machine(role).ifaces.iter() {
            if !done.insert((conn.host().to_string(), iface.dev.clone())) {
                continue;
            }
            conn.run(
                format!("ethtool -K {} tso off gso off gro off lro off", iface.dev),
                &RunOptions::new().sudo(),
            )
            .await?
            .warn(format!("Failed to turn off offloads on {}", iface.dev));
        }
    }
    Ok(())
}

/// Apply the kernel parameters of the config on every machine.
pub async fn update_sysctl(ctx: &RunContext) -> Result<(), EvalError> {
    if ctx.config.sysctl.is_empty() {
        return Ok(());
    }
    log::info!("Updating sysctl settings");
    for conn in ctx.conns() {
        for (k, v) in ctx.config.sysctl.iter() {
            let v = v.as_str().unwrap_or_default();
            conn.run(
                format!("sysctl -w {k}={}", shell_quote(v)),
                &RunOptions::new().sudo(),
            )
            .await?
            .expect(format!("Failed to set sysctl {k}"))?;
        }
    }
    Ok(())
}

/// Ask the operator to confirm that existing results may be overwritten.
pub fn confirm_overwrite() -> Result<bool, EvalError> {
    let stdin = std::io::stdin();
    loop {
        print!("Overwrite existing results set to TRUE. Are you sure you want to continue? (y/n) ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim() {
            "y" => return Ok(true),
            "n" => return Ok(false),
            _ => continue,
        }
    }
}

/// Create the experiment directory on every machine, and locally. Locally, also keep a copy of
/// the config and the notes of the experiment.
pub async fn prepare_directories(ctx: &RunContext) -> Result<(), EvalError> {
    log::info!("Preparing result directories");
    let experiment_dir = ctx.experiment_dir();
    let ccp_dir = ctx.config.structure.ccp_dir();
    for conn in ctx.conns() {
        for dir in [&experiment_dir, &ccp_dir] {
            conn.sh(format!("mkdir -p {}", dir.display()))
                .await?
                .expect(format!("Failed to create directory {}", dir.display()))?;
        }
    }

    if ctx.is_dry() {
        return Ok(());
    }
    let local = ctx.local_experiment_dir();
    std::fs::create_dir_all(&local)?;
    if let Some(file_name) = ctx.config_path.file_name() {
        std::fs::copy(&ctx.config_path, local.clone().then(file_name))?;
    }
    let details = local.clone().then("details.md");
    if !details.exists() {
        std::fs::write(details, format!("{}\n", ctx.flags.details))?;
    }
    let results = local.then("results.md");
    if !results.exists() {
        std::fs::write(results, "TODO\n")?;
    }
    Ok(())
}

/// Synchronize the agents with their configured version, and check that the link emulator is
/// installed. Returns the commit of every agent.
pub async fn sync_versions(ctx: &RunContext) -> Result<BTreeMap<String, String>, EvalError> {
    log::info!("Synchronizing code versions");
    let machines = ctx.topology.machines();
    let commits = ccp::sync_agents(&ctx.config, machines.conn(Role::Inbox)).await?;

    if ctx.topology.is_emulated() {
        let receiver = machines.conn(Role::Receiver);
        if !receiver.prog_exists("mm-delay").await? {
            return Err(EvalError::MissingProgram {
                host: receiver.host().to_string(),
                program: "mahimahi (mm-delay)".to_string(),
            });
        }
    }
    Ok(commits)
}

/// Check that the shaper, the outbox, and the traffic generators exist where they are used.
pub async fn check_programs(ctx: &RunContext) -> Result<(), EvalError> {
    log::info!("Checking installed programs");
    let machines = ctx.topology.machines();
    let structure = &ctx.config.structure;
    let required = [
        (Role::Inbox, structure.inbox_binary().display().to_string(), true),
        (Role::Outbox, structure.outbox_binary().display().to_string(), true),
        (Role::Sender, structure.iperf_path.clone(), false),
        (Role::Receiver, structure.iperf_path.clone(), false),
    ];
    for (role, program, is_file) in required {
        let conn = machines.conn(role);
        let found = if is_file {
            conn.file_exists(&program).await?
        } else {
            conn.prog_exists(&program).await?
        };
        if !found {
            return Err(EvalError::MissingProgram {
                host: conn.host().to_string(),
                program,
            });
        }
    }
    Ok(())
}

fn uses_poisson(config: &Config) -> bool {
    ["bundle_traffic", "cross_traffic"].iter().any(|axis| {
        config
            .experiment
            .get(*axis)
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|v| Vec::<TrafficPattern>::deserialize(v.clone()).ok())
            .flatten()
            .any(|t| matches!(t, TrafficPattern::Poisson { .. }))
    })
}

/// Upload the request size distributions that are missing on the machine running the poisson
/// clients.
pub async fn upload_distributions(ctx: &RunContext) -> Result<(), EvalError> {
    if !uses_poisson(&ctx.config) {
        return Ok(());
    }
    let receiver = ctx.topology.machines().conn(Role::Receiver);
    let dir = ctx.config.structure.distribution_dir();
    receiver
        .sh(format!("mkdir -p {}", dir.display()))
        .await?
        .expect(format!("Failed to create distributions directory {}", dir.display()))?;

    for (name, path) in ctx.config.distributions.iter() {
        let remote = dir.clone().then(name);
        if !receiver.file_exists(&remote).await? {
            log::info!("[{}] uploading distribution {name}", receiver.nickname());
            let content = std::fs::read(expand_home(path))?;
            receiver.put(content, &remote).await?;
        }
    }
    Ok(())
}

/// Processes that must not survive an iteration.
pub fn leftover_patterns(config: &Config) -> Vec<ProcessPattern> {
    let iperf = config.structure.iperf_path.rsplit('/').next().unwrap_or("iperf");
    let mut patterns = vec![
        ProcessPattern::exact("inbox"),
        ProcessPattern::exact("outbox"),
        ProcessPattern::exact(iperf),
        ProcessPattern::exact("etgClient"),
        ProcessPattern::exact("etgServer"),
        ProcessPattern::full("run-servers.py"),
        ProcessPattern::exact("mm-delay"),
        ProcessPattern::exact("mm-link"),
        ProcessPattern::full("/proc/net/tcpprobe"),
    ];
    for alg in config.ccp.keys() {
        if let Ok(p) = ccp::process_pattern(config, alg) {
            if !patterns.contains(&p) {
                patterns.push(p);
            }
        }
    }
    patterns
}

/// Kill all processes of previous iterations on every machine, and make sure they are gone.
pub async fn kill_leftover_procs(ctx: &RunContext) -> Result<(), EvalError> {
    let patterns = leftover_patterns(&ctx.config);
    for conn in ctx.conns() {
        for p in patterns.iter() {
            // pkill fails if nothing matched.
            conn.kill(p).await?;
        }
    }
    if ctx.is_dry() {
        return Ok(());
    }

    tokio::time::sleep(ctx.readiness.interval).await;
    for conn in ctx.conns() {
        for p in patterns.iter() {
            if conn.check_proc(p).await? {
                return Err(EvalError::LeftoverProcess {
                    host: conn.host().to_string(),
                    pattern: p.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Record all TCP connections on the sender with the `tcp_probe` module.
pub async fn start_tcpprobe(
    env: &IterationEnv<'_>,
    sender: &Connection,
    state: &mut IterationState,
) -> Result<PathBuf, EvalError> {
    log::info!("[{}] Starting tcpprobe", sender.nickname());
    sender
        .run("modprobe tcp_probe port=0 full=1", &RunOptions::new().sudo())
        .await?
        .expect("Failed to load tcp_probe")?;
    sender
        .run(
            "dd if=/dev/null of=/proc/net/tcpprobe bs=256",
            &RunOptions::new().sudo().background(),
        )
        .await?
        .expect("Failed to reset tcpprobe")?;
    let out = env.iteration_dir.then("tcpprobe.out");
    sender
        .run(
            format!("dd if=/proc/net/tcpprobe of={} bs=256", out.display()),
            &RunOptions::new().sudo().background(),
        )
        .await?
        .expect("Failed to start tcpprobe")?;
    state.register(sender, &out);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::test::EMULATED,
        experiments::runner::RunFlags,
        remote::{test::RecordingTransport, ReadinessPolicy},
        topology::{test::machines, EmulatedTopology, Topology},
    };

    fn context(content: &str, transport: impl Fn() -> RecordingTransport, flags: RunFlags) -> RunContext {
        let config = Config::parse(content).unwrap();
        let topology = Topology::Emulated(EmulatedTopology::new(machines(&config, transport)));
        RunContext::new(config, "eval.toml", "test", topology, flags)
            .with_readiness(ReadinessPolicy::immediate())
    }

    #[tokio::test]
    async fn leftover_process_is_fatal() {
        // every process is still found after killing it.
        let ctx = context(EMULATED, RecordingTransport::default, RunFlags::default());
        let err = kill_leftover_procs(&ctx).await.unwrap_err();
        assert!(matches!(err, EvalError::LeftoverProcess { .. }), "{err}");

        let ctx = context(
            EMULATED,
            || RecordingTransport::default().respond("pgrep", 1, ""),
            RunFlags::default(),
        );
        kill_leftover_procs(&ctx).await.unwrap();
        let inbox = ctx.topology.machines().conn(Role::Inbox).history();
        assert!(inbox.contains(&"sudo pkill -9 -x 'inbox'".to_string()));
        assert!(inbox.contains(&"sudo pkill -9 -x 'ccp_example_alg'".to_string()));
        assert!(inbox.contains(&"pgrep -f '[r]un-servers.py'".to_string()));
    }

    #[tokio::test]
    async fn host_preparation() {
        let ctx = context(EMULATED, RecordingTransport::default, RunFlags::default());
        disable_offloads(&ctx).await.unwrap();
        update_sysctl(&ctx).await.unwrap();

        let inbox = ctx.topology.machines().conn(Role::Inbox).history();
        assert_eq!(
            inbox,
            vec![
                "sudo ethtool -K eth1 tso off gso off gro off lro off",
                "sudo ethtool -K eth2 tso off gso off gro off lro off",
                "sudo sysctl -w net.ipv4.tcp_rmem='4096 87380 6291456'",
            ]
        );
        // outbox and receiver share the host and the interface.
        let receiver = ctx.topology.machines().conn(Role::Receiver).history();
        assert_eq!(receiver.iter().filter(|c| c.contains("ethtool")).count(), 1);
    }

    #[tokio::test]
    async fn directories_and_notes() {
        let root = tempfile::tempdir().unwrap();
        let config_path = root.path().then("eval.toml");
        let content = EMULATED.replace("/tmp/bundler-eval", &root.path().display().to_string());
        std::fs::write(&config_path, &content).unwrap();

        let flags = RunFlags {
            details: "first run".to_string(),
            ..Default::default()
        };
        let mut ctx = context(&content, RecordingTransport::default, flags);
        ctx.config_path = config_path;
        prepare_directories(&ctx).await.unwrap();

        let local = ctx.local_experiment_dir();
        assert_eq!(std::fs::read_to_string(local.clone().then("eval.toml")).unwrap(), content);
        assert_eq!(std::fs::read_to_string(local.clone().then("details.md")).unwrap(), "first run\n");
        assert_eq!(std::fs::read_to_string(local.then("results.md")).unwrap(), "TODO\n");
        let sender = ctx.topology.machines().conn(Role::Sender).history();
        assert_eq!(sender.len(), 2);
    }

    #[tokio::test]
    async fn missing_distributions_are_uploaded() {
        let root = tempfile::tempdir().unwrap();
        let dist = root.path().then("CAIDA_CDF");
        std::fs::write(&dist, "1 0.5\n").unwrap();
        let content = EMULATED.replace(
            r#"bundle_traffic = [[{ source = "iperf", port = 5001, flows = 1, length = 30, alg = "cubic", start_delay = 0 }]]"#,
            r#"bundle_traffic = [[{ source = "poisson", conns = 10, backlogged = 0, reqs = 100, dist = "CAIDA_CDF", load = 0.5, alg = "reno", start_delay = 0 }]]"#,
        ) + &format!("\n[distributions]\nCAIDA_CDF = \"{}\"\n", dist.display());

        let ctx = context(
            &content,
            || RecordingTransport::default().respond("ls", 1, ""),
            RunFlags::default(),
        );
        upload_distributions(&ctx).await.unwrap();
        let receiver = ctx.topology.machines().conn(Role::Receiver).history();
        assert_eq!(
            receiver,
            vec![
                "mkdir -p /tmp/bundler-eval/distributions",
                "ls /tmp/bundler-eval/distributions/CAIDA_CDF",
                "put -> /tmp/bundler-eval/distributions/CAIDA_CDF",
            ]
        );
    }

    #[tokio::test]
    async fn emulator_must_be_installed() {
        let ctx = context(
            EMULATED,
            || {
                RecordingTransport::default()
                    .respond("which mm-delay", 1, "")
                    .respond("rev-parse HEAD", 0, "abc\n")
                    .respond("rev-parse --abbrev-ref HEAD", 0, "master\n")
            },
            RunFlags::default(),
        );
        let err = sync_versions(&ctx).await.unwrap_err();
        assert!(matches!(err, EvalError::MissingProgram { .. }), "{err}");
    }
}
