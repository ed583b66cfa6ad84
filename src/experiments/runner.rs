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
//! Module that executes the iterations of a sweep, one after the other.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use indicatif::HumanDuration;

use super::{setup, ExperimentConfig};
use crate::{
    ccp,
    config::Config,
    jobs::JobList,
    remote::{Connection, ProcessPattern, ReadinessCheck, ReadinessPolicy, RunOptions},
    topology::{Role, Topology, INBOX_READY},
    traffic::TrafficSpec,
    util::{expand_home, PathBufExt},
    EvalError,
};

/// Everything a component needs to know about the iteration that is currently running.
#[derive(Debug, Clone, Copy)]
pub struct IterationEnv<'a> {
    pub config: &'a Config,
    /// Iteration directory on the remote machines.
    pub iteration_dir: &'a Path,
    pub readiness: &'a ReadinessPolicy,
}

/// Mutable state of a single iteration: the files to collect, and the counters used to name the
/// outputs of the traffic generators.
#[derive(Debug, Default)]
pub struct IterationState {
    outputs: Vec<(Connection, PathBuf)>,
    etg_configs: u32,
    etg_servers: u32,
    /// Number of etg servers that must be running, per host.
    expected_etg_servers: HashMap<String, u32>,
}

impl IterationState {
    /// Register a file on `conn` that is collected after the iteration.
    pub fn register(&mut self, conn: &Connection, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.outputs.iter().any(|(c, p)| c.same(conn) && *p == path) {
            self.outputs.push((conn.clone(), path));
        }
    }

    pub fn outputs(&self) -> &[(Connection, PathBuf)] {
        &self.outputs
    }

    /// Index of the next generated etg client configuration, starting at 1.
    pub fn next_etg_config(&mut self) -> u32 {
        self.etg_configs += 1;
        self.etg_configs
    }

    /// Index of the next etg server group, starting at 1.
    pub fn next_etg_server(&mut self) -> u32 {
        self.etg_servers += 1;
        self.etg_servers
    }

    /// Add `conns` servers to the number of etg servers that must be running on `conn`. Returns
    /// the total for that host.
    pub fn expect_etg_servers(&mut self, conn: &Connection, conns: u32) -> u32 {
        let expected = self
            .expected_etg_servers
            .entry(conn.host().to_string())
            .or_default();
        *expected += conns;
        *expected
    }
}

/// Flags of the command line that change how the sweep is run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub dry_run: bool,
    pub verbose: bool,
    pub skip_git: bool,
    pub interact: bool,
    pub skip_existing: bool,
    pub overwrite_existing: bool,
    pub tcpprobe: bool,
    pub details: String,
}

/// How to treat results of an iteration that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingPolicy {
    /// Existing results abort the run.
    Abort,
    Skip,
    Overwrite,
}

impl ExistingPolicy {
    pub fn from_flags(skip_existing: bool, overwrite_existing: bool) -> Result<Self, EvalError> {
        match (skip_existing, overwrite_existing) {
            (true, true) => Err(EvalError::ConflictingPolicy),
            (true, false) => Ok(Self::Skip),
            (false, true) => Ok(Self::Overwrite),
            (false, false) => Ok(Self::Abort),
        }
    }
}

/// What to do with the iteration directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Fresh,
    Skip,
    Overwrite,
}

/// Decide what to do with the iteration directory at `path`.
pub fn resolve_existing(
    path: &Path,
    exists: bool,
    policy: ExistingPolicy,
) -> Result<Resolution, EvalError> {
    match (exists, policy) {
        (false, _) => Ok(Resolution::Fresh),
        (true, ExistingPolicy::Skip) => Ok(Resolution::Skip),
        (true, ExistingPolicy::Overwrite) => Ok(Resolution::Overwrite),
        (true, ExistingPolicy::Abort) => Err(EvalError::ExistingResults(path.to_path_buf())),
    }
}

/// Immutable context of a run.
#[derive(Debug)]
pub struct RunContext {
    pub config: Config,
    pub config_path: PathBuf,
    /// Name of the experiment (directory below the experiment root).
    pub name: String,
    pub topology: Topology,
    pub flags: RunFlags,
    pub readiness: ReadinessPolicy,
}

impl RunContext {
    pub fn new(
        config: Config,
        config_path: impl Into<PathBuf>,
        name: impl Into<String>,
        topology: Topology,
        flags: RunFlags,
    ) -> Self {
        Self {
            config,
            config_path: config_path.into(),
            name: name.into(),
            topology,
            flags,
            readiness: ReadinessPolicy::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Experiment directory on the remote machines.
    pub fn experiment_dir(&self) -> PathBuf {
        self.config.structure.experiment_root().then(&self.name)
    }

    /// Experiment directory on the machine running the orchestrator.
    pub fn local_experiment_dir(&self) -> PathBuf {
        expand_home(self.experiment_dir())
    }

    pub fn is_dry(&self) -> bool {
        self.flags.dry_run
    }

    pub fn conns(&self) -> &[Connection] {
        self.topology.machines().unique()
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Results exist and were kept.
    Skipped,
    /// The combination of algorithm and scheduler cannot be run.
    Unsupported,
    Completed {
        /// Time from starting the shaper until the traffic finished.
        elapsed: Duration,
        collected: usize,
        missing: usize,
    },
}

/// Summary of a whole sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub completed: usize,
    pub skipped: usize,
    pub unsupported: usize,
    /// Sum of the time spent running traffic.
    pub traffic_time: Duration,
}

/// Runs the iterations of a sweep. Each iteration directory can be prepared only once.
#[derive(Debug)]
pub struct IterationRunner<'a> {
    ctx: &'a RunContext,
    policy: ExistingPolicy,
    booked: HashSet<PathBuf>,
}

impl<'a> IterationRunner<'a> {
    pub fn new(ctx: &'a RunContext) -> Result<Self, EvalError> {
        Ok(Self {
            ctx,
            policy: ExistingPolicy::from_flags(ctx.flags.skip_existing, ctx.flags.overwrite_existing)?,
            booked: HashSet::new(),
        })
    }

    /// Reserve the iteration directory. Fails if it was already reserved during this run.
    pub fn book(&mut self, dir: &Path) -> Result<(), EvalError> {
        if !self.booked.insert(dir.to_path_buf()) {
            return Err(EvalError::IterationNotReset(dir.to_path_buf()));
        }
        Ok(())
    }

    /// Run all experiments in order, and abort on the first error.
    pub async fn run_sweep(&mut self, exps: &[ExperimentConfig]) -> Result<SweepSummary, EvalError> {
        let total = exps.len();
        let digits = total.to_string().len();
        let start = Instant::now();
        let mut summary = SweepSummary::default();

        for (i, exp) in exps.iter().enumerate() {
            log::info!("{:0digits$}/{total} | {exp}", i + 1);
            match self.run(exp).await? {
                IterationOutcome::Skipped => summary.skipped += 1,
                IterationOutcome::Unsupported => summary.unsupported += 1,
                IterationOutcome::Completed { elapsed, .. } => {
                    summary.completed += 1;
                    summary.traffic_time += elapsed;
                    let done = i + 1;
                    let eta = start.elapsed().mul_f64((total - done) as f64 / done as f64);
                    log::info!(
                        "Ran for {}, remaining: {}",
                        HumanDuration(elapsed),
                        HumanDuration(eta)
                    );
                }
            }
        }
        Ok(summary)
    }

    /// Run a single iteration: prepare its directory, start shaper and agent, run the traffic,
    /// tear everything down, and collect the outputs.
    pub async fn run(&mut self, exp: &ExperimentConfig) -> Result<IterationOutcome, EvalError> {
        if !exp.is_supported() {
            log::info!("skipping: {} cannot be run with scheduler {}", exp.alg, exp.sch);
            return Ok(IterationOutcome::Unsupported);
        }

        let name = exp.iteration_name();
        let dir = self.ctx.experiment_dir().then(&name);
        let local_dir = self.ctx.local_experiment_dir().then(&name);

        let bundle = exp.bundle_specs();
        let cross = exp.cross_specs();
        self.check_ports(&bundle, &cross)?;

        match resolve_existing(&local_dir, local_dir.exists(), self.policy)? {
            Resolution::Skip => {
                log::info!("skipping {name}");
                return Ok(IterationOutcome::Skipped);
            }
            Resolution::Overwrite => {
                log::info!("overwriting {name}");
                self.clear(&dir, &local_dir).await?;
            }
            Resolution::Fresh => log::info!("fresh {name}"),
        }

        self.prepare(&dir, &local_dir).await?;
        setup::kill_leftover_procs(self.ctx).await?;

        let env = IterationEnv {
            config: &self.ctx.config,
            iteration_dir: &dir,
            readiness: &self.ctx.readiness,
        };
        let mut state = IterationState::default();

        let start = Instant::now();
        let result = self.execute(&env, exp, &bundle, &cross, &mut state).await;
        let elapsed = start.elapsed();
        if let Err(e) = &result {
            log::error!("Iteration {name} failed: {e}");
        }

        let teardown = setup::kill_leftover_procs(self.ctx).await;
        let (collected, missing) = self.collect(&state, &local_dir).await;
        result?;
        teardown?;

        Ok(IterationOutcome::Completed {
            elapsed,
            collected,
            missing,
        })
    }

    fn check_ports(&self, bundle: &[TrafficSpec], cross: &[TrafficSpec]) -> Result<(), EvalError> {
        let params = &self.ctx.config.parameters;
        let (start, end) = (params.bg_port_start, params.bg_port_end());
        for t in bundle {
            t.check_port_range(true, start, end)?;
        }
        for t in cross {
            t.check_port_range(false, start, end)?;
        }
        Ok(())
    }

    /// Remove the results of a previous run, remotely and locally.
    async fn clear(&self, dir: &Path, local_dir: &Path) -> Result<(), EvalError> {
        for conn in self.ctx.conns() {
            conn.run(
                format!("rm -rf {}", dir.display()),
                &RunOptions::new().sudo(),
            )
            .await?
            .expect(format!("Failed to remove existing iteration directory {}", dir.display()))?;
        }
        if !self.ctx.is_dry() && local_dir.exists() {
            std::fs::remove_dir_all(local_dir)?;
        }
        Ok(())
    }

    async fn prepare(&mut self, dir: &Path, local_dir: &Path) -> Result<(), EvalError> {
        self.book(dir)?;
        for conn in self.ctx.conns() {
            conn.sh(format!("mkdir -p {}", dir.display()))
                .await?
                .expect(format!("Failed to create iteration directory {}", dir.display()))?;
        }
        if !self.ctx.is_dry() {
            std::fs::create_dir_all(local_dir)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        env: &IterationEnv<'_>,
        exp: &ExperimentConfig,
        bundle: &[TrafficSpec],
        cross: &[TrafficSpec],
        state: &mut IterationState,
    ) -> Result<(), EvalError> {
        let topo = &self.ctx.topology;
        let machines = topo.machines();

        if !exp.alg.is_baseline() {
            let inbox = machines.conn(Role::Inbox);
            let buffer = self.ctx.config.parameters.qdisc_buf_size.to_string();
            let inbox_out = topo.start_inbox_shaper(env, &exp.sch, &buffer, state).await?;
            ccp::start_agent(env, inbox, &exp.alg, state).await?;
            let ready = ReadinessCheck::process(ProcessPattern::exact("inbox"))
                .with_marker(&inbox_out, INBOX_READY);
            inbox.wait_ready(&ready, env.readiness).await?;
        }

        if self.ctx.flags.tcpprobe {
            setup::start_tcpprobe(env, machines.conn(Role::Sender), state).await?;
        }

        let sender = machines.conn(Role::Sender);
        for t in bundle {
            t.start_server(env, sender, state).await?;
        }
        let (cross_role, cross_target) = topo.cross_source()?;
        for t in cross {
            t.start_server(env, machines.conn(cross_role), state).await?;
        }

        let receiver = machines.conn(Role::Receiver);
        let bundle_target = machines.addr(Role::Sender)?.to_string();
        let mut bundle_jobs = JobList::new();
        for t in bundle {
            bundle_jobs.push(t.client_job(env, receiver, &bundle_target, true, state).await?);
        }
        let mut cross_jobs = JobList::new();
        for t in cross {
            cross_jobs.push(t.client_job(env, receiver, &cross_target, false, state).await?);
        }

        topo.run_traffic(env, exp, bundle_jobs, cross_jobs, state).await
    }

    /// Copy every registered output into the local iteration directory. Missing files are only
    /// reported. Returns the number of collected and missing files.
    async fn collect(&self, state: &IterationState, local_dir: &Path) -> (usize, usize) {
        log::info!("collecting results");
        let (mut collected, mut missing) = (0, 0);
        for (conn, remote) in state.outputs() {
            let Some(file_name) = remote.file_name() else {
                continue;
            };
            let local = local_dir.then(file_name);
            if conn.is_local() && expand_home(remote) == local {
                collected += 1;
                continue;
            }
            match conn.get(remote, &local).await {
                Ok(()) => collected += 1,
                Err(e) => {
                    log::warn!("[{}] could not get file {}: {e}", conn.nickname(), remote.display());
                    missing += 1;
                }
            }
        }
        (collected, missing)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::test::EMULATED,
        experiments::{sweep, Algorithm, BASELINE},
        remote::test::RecordingTransport,
        topology::{test::machines, EmulatedTopology},
    };

    async fn context(root: &Path, flags: RunFlags) -> RunContext {
        let content = EMULATED.replace("/tmp/bundler-eval", &root.display().to_string());
        let config = Config::parse(&content).unwrap();
        let topology = Topology::connect(&config, true, false).await.unwrap();
        RunContext::new(config, "eval.toml", "test", topology, flags)
            .with_readiness(ReadinessPolicy::immediate())
    }

    fn dry() -> RunFlags {
        RunFlags {
            dry_run: true,
            ..Default::default()
        }
    }

    fn experiments(ctx: &RunContext) -> Vec<ExperimentConfig> {
        sweep::experiments(&ctx.config.experiment).unwrap()
    }

    #[test]
    fn existing_results() {
        let p = Path::new("/exp/it");
        assert_eq!(
            resolve_existing(p, false, ExistingPolicy::Abort).unwrap(),
            Resolution::Fresh
        );
        assert_eq!(
            resolve_existing(p, true, ExistingPolicy::Skip).unwrap(),
            Resolution::Skip
        );
        assert_eq!(
            resolve_existing(p, true, ExistingPolicy::Overwrite).unwrap(),
            Resolution::Overwrite
        );
        assert!(matches!(
            resolve_existing(p, true, ExistingPolicy::Abort),
            Err(EvalError::ExistingResults(_))
        ));
        assert!(matches!(
            ExistingPolicy::from_flags(true, true),
            Err(EvalError::ConflictingPolicy)
        ));
    }

    #[tokio::test]
    async fn single_booking() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), dry()).await;
        let mut runner = IterationRunner::new(&ctx).unwrap();
        runner.book(Path::new("/exp/a")).unwrap();
        runner.book(Path::new("/exp/b")).unwrap();
        assert!(matches!(
            runner.book(Path::new("/exp/a")),
            Err(EvalError::IterationNotReset(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_issues_every_command() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), dry()).await;
        let exps = experiments(&ctx);
        let mut runner = IterationRunner::new(&ctx).unwrap();
        let summary = runner.run_sweep(&exps).await.unwrap();
        assert_eq!(summary.completed, 2);

        let machines = ctx.topology.machines();
        let inbox = machines.conn(Role::Inbox).history();
        assert!(inbox.iter().any(|c| c.contains("target/debug/inbox --iface=eth2")));
        assert!(inbox.iter().any(|c| c.contains("nimbus --ipc=unix --flow_mode=XTCP --alpha=0")));
        assert!(inbox.iter().any(|c| c.contains("nimbus --ipc=unix --flow_mode=XTCP --alpha=1")));
        let sender = machines.conn(Role::Sender).history();
        assert!(sender.iter().any(|c| c.contains("iperf -s -p 5001")));
        let receiver = machines.conn(Role::Receiver).history();
        assert!(receiver.iter().any(|c| c.contains("mm-delay 25 mm-link")));

        // nothing was written locally
        assert!(!ctx.local_experiment_dir().exists());
    }

    #[tokio::test]
    async fn existing_results_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let flags = RunFlags {
            skip_existing: true,
            ..dry()
        };
        let ctx = context(root.path(), flags).await;
        let exps = experiments(&ctx);
        std::fs::create_dir_all(ctx.local_experiment_dir().then(exps[0].iteration_name())).unwrap();

        let mut runner = IterationRunner::new(&ctx).unwrap();
        assert_eq!(runner.run(&exps[0]).await.unwrap(), IterationOutcome::Skipped);
        assert!(ctx.topology.machines().conn(Role::Inbox).history().is_empty());
        assert!(matches!(
            runner.run(&exps[1]).await.unwrap(),
            IterationOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn existing_results_without_policy_abort() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), dry()).await;
        let exps = experiments(&ctx);
        std::fs::create_dir_all(ctx.local_experiment_dir().then(exps[0].iteration_name())).unwrap();

        let mut runner = IterationRunner::new(&ctx).unwrap();
        assert!(matches!(
            runner.run(&exps[0]).await,
            Err(EvalError::ExistingResults(_))
        ));
    }

    #[tokio::test]
    async fn existing_results_are_overwritten() {
        let root = tempfile::tempdir().unwrap();
        let flags = RunFlags {
            overwrite_existing: true,
            ..dry()
        };
        let ctx = context(root.path(), flags).await;
        let exps = experiments(&ctx);
        let local = ctx.local_experiment_dir().then(exps[0].iteration_name());
        std::fs::create_dir_all(&local).unwrap();

        let mut runner = IterationRunner::new(&ctx).unwrap();
        runner.run(&exps[0]).await.unwrap();
        let inbox = ctx.topology.machines().conn(Role::Inbox).history();
        assert!(inbox[0].starts_with("sudo rm -rf "), "{}", inbox[0]);
        // dry runs never touch local files
        assert!(local.exists());
    }

    #[tokio::test]
    async fn baseline_needs_fifo_or_sfq() {
        let root = tempfile::tempdir().unwrap();
        let ctx = context(root.path(), dry()).await;
        let mut exp = experiments(&ctx).remove(0);
        exp.alg = Algorithm {
            name: BASELINE.to_string(),
            params: Default::default(),
        };
        exp.sch = "prio".to_string();

        let mut runner = IterationRunner::new(&ctx).unwrap();
        assert_eq!(runner.run(&exp).await.unwrap(), IterationOutcome::Unsupported);

        // with fifo, neither inbox nor agent is started.
        exp.sch = "fifo".to_string();
        runner.run(&exp).await.unwrap();
        let inbox = ctx.topology.machines().conn(Role::Inbox).history();
        assert!(!inbox.iter().any(|c| c.contains("--ipc=unix")));
        assert!(!inbox.iter().any(|c| c.contains("target/debug/inbox")));
    }

    #[tokio::test]
    async fn unready_inbox_blocks_traffic() {
        let root = tempfile::tempdir().unwrap();
        let content = EMULATED.replace("/tmp/bundler-eval", &root.path().display().to_string());
        let config = Config::parse(&content).unwrap();
        // nothing is left over; once the inbox is started, all processes run, but the inbox
        // never reports that it is ready.
        let transport = || {
            RecordingTransport::default()
                .respond("pgrep", 1, "")
                .respond_after("--qtype=", "pgrep", 0, "")
                .respond(&format!("grep -F -q '{INBOX_READY}'"), 1, "")
        };
        let topology = Topology::Emulated(EmulatedTopology::new(machines(&config, transport)));
        let ctx = RunContext::new(config, "eval.toml", "test", topology, RunFlags::default())
            .with_readiness(ReadinessPolicy::immediate());
        let exps = experiments(&ctx);

        let mut runner = IterationRunner::new(&ctx).unwrap();
        let err = runner.run(&exps[0]).await.unwrap_err();
        assert!(
            matches!(&err, EvalError::NotReady { reason, .. } if reason.contains(INBOX_READY)),
            "{err}"
        );

        let machines = ctx.topology.machines();
        assert!(machines
            .conn(Role::Inbox)
            .history()
            .iter()
            .any(|c| c.contains("--qtype=fifo")));
        for role in Role::ALL {
            let started: Vec<String> = machines
                .conn(role)
                .history()
                .into_iter()
                .filter(|c| !c.contains("pkill") && !c.starts_with("pgrep"))
                .collect();
            assert!(
                !started
                    .iter()
                    .any(|c| c.contains("mm-delay") || c.contains("iperf") || c.contains("traffic.sh")),
                "{role}: {started:?}"
            );
        }
    }
}
