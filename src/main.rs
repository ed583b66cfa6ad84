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
use std::{path::PathBuf, time::Instant};

use clap::Parser;
use indicatif::HumanDuration;
use tokio::process::Command;

use bundler_eval::{
    experiments::setup,
    prelude::*,
    util::{self, shell_quote},
};
use eval_utils::{
    manifest::VersionManifest,
    other::{current_user, send_notification},
};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Configuration file of the experiment.
    config: PathBuf,
    /// Name of the experiment directory.
    #[arg(long)]
    name: String,
    /// Only print the commands without executing them.
    #[arg(long)]
    dry_run: bool,
    /// Print every command that is executed. Repeat for more log output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Do not synchronize the agents with their configured version.
    #[arg(long)]
    skip_git: bool,
    /// Ask for confirmation before each command.
    #[arg(long)]
    interact: bool,
    /// Keep existing results and skip their iterations.
    #[arg(long, conflicts_with = "overwrite_existing")]
    skip_existing: bool,
    /// Remove existing results and run their iterations again.
    #[arg(long)]
    overwrite_existing: bool,
    /// Record all TCP connections on the sender with tcp_probe.
    #[arg(long)]
    tcpprobe: bool,
    /// Extra information to include in the experiment report.
    #[arg(long, default_value = "")]
    details: String,
    /// Downsampling of the measurements when parsing the results.
    #[arg(long, default_value_t = 1)]
    downsample: usize,
    /// Rows to split the graph upon.
    #[arg(long, default_value = "")]
    rows: String,
    /// Columns to split the graph upon.
    #[arg(long, default_value = "")]
    cols: String,
}

impl Args {
    fn flags(&self) -> RunFlags {
        RunFlags {
            dry_run: self.dry_run,
            verbose: self.verbose > 0 || self.dry_run,
            skip_git: self.skip_git,
            interact: self.interact,
            skip_existing: self.skip_existing,
            overwrite_existing: self.overwrite_existing,
            tcpprobe: self.tcpprobe,
            details: self.details.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    util::init_logging(args.verbose)?;

    if let Err(e) = run(args).await {
        log::error!("{e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let flags = args.flags();
    if flags.interact {
        log::warn!("Running in interactive mode. Each command is printed before it's run.");
    }

    let config = Config::read(&args.config)?;
    let webhook = config.notify.webhook.clone();
    let exps = enumerate(&config.experiment)?;

    let topology = Topology::connect(&config, flags.dry_run, flags.verbose).await?;
    let ctx = RunContext::new(config, &args.config, &args.name, topology, flags);
    let mut runner = IterationRunner::new(&ctx)?;
    for conn in ctx.conns() {
        conn.set_interact(ctx.flags.interact);
    }

    ctx.topology.setup_routing().await?;
    setup::disable_offloads(&ctx).await?;
    setup::update_sysctl(&ctx).await?;

    if ctx.flags.overwrite_existing && !ctx.is_dry() && !setup::confirm_overwrite()? {
        return Ok(());
    }
    setup::prepare_directories(&ctx).await?;
    setup::check_programs(&ctx).await?;
    setup::upload_distributions(&ctx).await?;

    if !ctx.flags.skip_git {
        let commits = setup::sync_versions(&ctx).await?;
        if !ctx.is_dry() {
            let mut manifest = VersionManifest::new(&ctx.name);
            for (alg, commit) in commits.iter() {
                manifest.record(alg, commit);
            }
            manifest.write_to(ctx.local_experiment_dir().join("versions.json"))?;
        }
    }

    let total = exps.len();
    send_notification(
        webhook.as_deref(),
        format!(
            "**{}** started a new experiment: `{}` ({total} configs)\n```quote\n{}\n```",
            current_user(),
            ctx.name,
            ctx.flags.details
        ),
        ctx.is_dry(),
    )
    .await;

    let start = Instant::now();
    let summary = runner.run_sweep(&exps).await?;
    setup::kill_leftover_procs(&ctx).await?;
    log::info!(
        "Finished {} iterations ({} skipped, {} unsupported) in {}",
        summary.completed,
        summary.skipped,
        summary.unsupported,
        HumanDuration(start.elapsed())
    );

    if !ctx.is_dry() {
        parse_results(&ctx, &args).await?;
    }

    send_notification(
        webhook.as_deref(),
        format!(
            "{total} experiment(s) finished in **{}**.\nResults: {}",
            HumanDuration(start.elapsed()),
            ctx.experiment_dir().display()
        ),
        ctx.is_dry(),
    )
    .await;
    Ok(())
}

/// Hand the experiment directory to the configured parser.
async fn parse_results(ctx: &RunContext, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let Some(parse_command) = ctx.config.structure.parse_command.as_ref() else {
        log::debug!("No parse command configured.");
        return Ok(());
    };
    log::info!("parsing results");
    let mut cmd = format!(
        "{parse_command} {} --downsample {}",
        shell_quote(ctx.local_experiment_dir().display().to_string()),
        args.downsample
    );
    if !args.rows.is_empty() {
        cmd.push_str(&format!(" --rows {}", shell_quote(&args.rows)));
    }
    if !args.cols.is_empty() {
        cmd.push_str(&format!(" --cols {}", shell_quote(&args.cols)));
    }
    let status = Command::new("sh").args(["-c", &cmd]).status().await?;
    if !status.success() {
        log::warn!("Parsing the results failed: `{cmd}` exited with {status}");
    }
    Ok(())
}
