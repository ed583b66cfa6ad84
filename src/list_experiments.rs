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
use std::path::PathBuf;

use clap::Parser;

use bundler_eval::{experiments::sweep, prelude::*, util, util::PathBufExt};

#[derive(Parser, Debug)]
#[command(about = "List all iterations of a sweep without contacting any machine", long_about = None)]
struct Args {
    /// Configuration file of the experiment.
    config: PathBuf,
    /// Name of the experiment directory.
    #[arg(long, default_value = "<name>")]
    name: String,
    /// Print the iterations in the order in which they will be run (shuffled).
    #[arg(long)]
    shuffle: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    util::init_logging(0)?;
    let args = Args::parse();

    let config = Config::read(&args.config)?;
    let exps = if args.shuffle {
        enumerate(&config.experiment)?
    } else {
        sweep::experiments(&config.experiment)?
    };
    let root = config.structure.experiment_root().then(&args.name);

    let mut unsupported = 0;
    for exp in exps.iter() {
        if !exp.is_supported() {
            unsupported += 1;
            continue;
        }
        println!("{exp}\n    {}", root.clone().then(exp.iteration_name()).display());
    }
    log::info!(
        "{} iterations ({unsupported} of them are not supported and will be skipped)",
        exps.len()
    );
    Ok(())
}
