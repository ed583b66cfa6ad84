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
//! Congestion control agents, attached to the inbox via IPC.

use std::{collections::BTreeMap, path::PathBuf};

use crate::{
    config::{render_value, AgentLanguage, CcpAlgConfig, Config},
    experiments::{
        runner::{IterationEnv, IterationState},
        Algorithm,
    },
    remote::{Connection, ProcessPattern, ReadinessCheck, RunOptions},
    util::PathBufExt,
    EvalError,
};

/// Log marker of an agent once it is running.
pub const AGENT_READY: &str = "starting CCP";
/// Maximum length of a process name as matched by `pgrep -x`.
const MAX_PROC_NAME: usize = 15;

fn alg_config<'a>(config: &'a Config, alg: &str) -> Result<&'a CcpAlgConfig, EvalError> {
    config
        .ccp
        .get(alg)
        .ok_or_else(|| EvalError::UnknownAlgorithm(alg.to_string()))
}

/// Directory into which the repository of the agent is cloned.
pub fn alg_dir(config: &Config, alg: &str) -> Result<PathBuf, EvalError> {
    let c = alg_config(config, alg)?;
    let repo = c.repo.trim_end_matches('/');
    let name = repo.rsplit('/').next().unwrap_or(repo);
    let name = name.strip_suffix(".git").unwrap_or(name);
    Ok(config.structure.ccp_dir().then(name))
}

/// Command that runs the agent binary.
pub fn binary_path(config: &Config, alg: &str) -> Result<String, EvalError> {
    let c = alg_config(config, alg)?;
    let path = alg_dir(config, alg)?.then(&c.target);
    Ok(match c.language {
        AgentLanguage::Rust => path.display().to_string(),
        AgentLanguage::Python => format!("python {}", path.display()),
    })
}

/// Pattern to find the running agent.
pub fn process_pattern(config: &Config, alg: &str) -> Result<ProcessPattern, EvalError> {
    let c = alg_config(config, alg)?;
    let name = c.target.rsplit('/').next().unwrap_or(&c.target).to_string();
    Ok(match c.language {
        AgentLanguage::Rust if name.len() <= MAX_PROC_NAME => ProcessPattern::exact(name),
        _ => ProcessPattern::full(name),
    })
}

/// Arguments of the agent: the defaults of the config, overwritten by the parameters of the
/// experiment. Arguments set to `false` are omitted.
pub fn agent_args(c: &CcpAlgConfig, alg: &Algorithm) -> Vec<String> {
    let mut args: Vec<(String, String)> = c
        .args
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v)))
        .collect();
    for (k, v) in alg.params.iter() {
        let v = render_value(v);
        match args.iter_mut().find(|(key, _)| key == k) {
            Some(arg) => arg.1 = v,
            None => args.push((k.clone(), v)),
        }
    }
    args.into_iter()
        .filter(|(k, v)| k != "name" && v != "false")
        .map(|(k, v)| format!("--{k}={v}"))
        .collect()
}

/// Start the agent of the algorithm on the inbox, and wait until it runs. Returns its log.
pub async fn start_agent(
    env: &IterationEnv<'_>,
    inbox: &Connection,
    alg: &Algorithm,
    state: &mut IterationState,
) -> Result<PathBuf, EvalError> {
    log::info!("[{}] Starting ccp ({alg})", inbox.nickname());
    let c = alg_config(env.config, &alg.name)?;
    let out = env.iteration_dir.then("ccp.log");
    let mut cmd = format!("{} --ipc=unix", binary_path(env.config, &alg.name)?);
    for arg in agent_args(c, alg) {
        cmd.push(' ');
        cmd.push_str(&arg);
    }
    inbox
        .run(cmd, &RunOptions::new().sudo().background().output(&out))
        .await?
        .expect("Failed to start ccp")?;
    state.register(inbox, &out);

    let check = ReadinessCheck::process(process_pattern(env.config, &alg.name)?)
        .with_marker(&out, AGENT_READY);
    inbox.wait_ready(&check, env.readiness).await?;
    Ok(out)
}

/// Bring the repository of every agent to the configured branch and commit, and build it if
/// necessary. Returns the checked-out commit of each agent.
pub async fn sync_agents(
    config: &Config,
    node: &Connection,
) -> Result<BTreeMap<String, String>, EvalError> {
    let mut commits = BTreeMap::new();
    for (alg, details) in config.ccp.iter() {
        log::info!("[{}] Synchronize {alg}", node.nickname());
        let dir = alg_dir(config, alg)?;
        let git = format!("git -C {}", dir.display());

        if !node.file_exists(&dir).await? {
            node.sh(format!("git clone {} {}", details.repo, dir.display()))
                .await?
                .expect(format!("node failed to clone {alg}"))?;
        }

        let branch = node.sh(format!("{git} rev-parse --abbrev-ref HEAD")).await?;
        if branch.stdout.trim() != details.branch {
            node.sh(format!("{git} checkout {}", details.branch))
                .await?
                .expect(format!("node failed to checkout branch {} of {alg}", details.branch))?;
        }

        let commit = node.sh(format!("{git} rev-parse HEAD")).await?.stdout;
        let commit = commit.trim().to_string();
        let mut recompile = false;
        if !commit.contains(&details.commit) {
            let pull = node
                .sh(format!("{git} pull"))
                .await?
                .expect(format!("node failed to pull latest code for {alg}"))?;
            if details.commit == "latest" {
                let up_to_date = pull.stdout.contains("Already up-to-date.")
                    || pull.stdout.contains("Already up to date.");
                recompile = !up_to_date;
            } else {
                node.sh(format!("{git} checkout {}", details.commit))
                    .await?
                    .expect(format!("node failed to checkout commit {} of {alg}", details.commit))?;
                recompile = true;
            }
        }

        if details.language == AgentLanguage::Rust {
            let binary = dir.clone().then(&details.target);
            if !node.file_exists(&binary).await? {
                log::info!("[{}] could not find binary of {alg}", node.nickname());
                recompile = true;
            }
            if recompile {
                log::info!("[{}] compiling {alg}", node.nickname());
                let release = if details.target.contains("release") { " --release" } else { "" };
                node.run(
                    format!("~/.cargo/bin/cargo build{release}"),
                    &RunOptions::new().workdir(&dir),
                )
                .await?
                .expect(format!("node failed to build {alg}"))?;
            }
        }

        let new_commit = node.sh(format!("{git} rev-parse HEAD")).await?.stdout;
        let new_commit = new_commit.trim().to_string();
        if new_commit != commit {
            log::info!(
                "[{}] updated {alg} {} -> {}",
                node.nickname(),
                commit.get(..6).unwrap_or(&commit),
                new_commit.get(..6).unwrap_or(&new_commit)
            );
        }
        commits.insert(alg.clone(), new_commit);
    }
    Ok(commits)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::test::EMULATED,
        remote::{
            test::{recording, RecordingTransport},
            ReadinessPolicy,
        },
    };

    fn nimbus(params: &[(&str, toml::Value)]) -> Algorithm {
        Algorithm {
            name: "nimbus".into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn paths() {
        let config = Config::parse(EMULATED).unwrap();
        assert_eq!(
            binary_path(&config, "nimbus").unwrap(),
            "/tmp/bundler-eval/ccp/nimbus/target/release/nimbus"
        );
        assert_eq!(process_pattern(&config, "nimbus").unwrap(), ProcessPattern::exact("nimbus"));
        assert_eq!(
            process_pattern(&config, "const").unwrap(),
            ProcessPattern::exact("ccp_example_alg")
        );
        assert!(matches!(
            binary_path(&config, "bbr"),
            Err(EvalError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn args_are_merged() {
        let config = Config::parse(EMULATED).unwrap();
        let c = &config.ccp["nimbus"];
        assert_eq!(agent_args(c, &nimbus(&[])), vec!["--flow_mode=XTCP"]);
        assert_eq!(
            agent_args(
                c,
                &nimbus(&[
                    ("flow_mode", "DELAY".into()),
                    ("alpha", toml::Value::Integer(1)),
                    ("bundler", "false".into()),
                ])
            ),
            vec!["--flow_mode=DELAY", "--alpha=1"]
        );
    }

    #[tokio::test]
    async fn agent_must_log_marker() {
        let config = Config::parse(EMULATED).unwrap();
        let dir = PathBuf::from("/exp/it");
        let policy = ReadinessPolicy::immediate();
        let env = IterationEnv {
            config: &config,
            iteration_dir: &dir,
            readiness: &policy,
        };
        let inbox = recording("inbox", RecordingTransport::default().respond("grep -F", 1, ""));
        let mut state = IterationState::default();
        let err = start_agent(&env, &inbox, &nimbus(&[]), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::NotReady { .. }));
        assert!(inbox.history()[0].starts_with(
            "nohup sudo /tmp/bundler-eval/ccp/nimbus/target/release/nimbus --ipc=unix --flow_mode=XTCP > /exp/it/ccp.log"
        ));
    }

    #[tokio::test]
    async fn sync_clones_and_builds() {
        let config = Config::parse(EMULATED).unwrap();
        let node = recording(
            "inbox",
            RecordingTransport::failing()
                .respond("rev-parse --abbrev-ref HEAD", 0, "master\n")
                .respond("rev-parse HEAD", 0, "0123456789abcdef\n")
                .respond("git clone", 0, "")
                .respond("pull", 0, "Updating 0123..4567\n")
                .respond("cargo build", 0, ""),
        );
        let commits = sync_agents(&config, &node).await.unwrap();
        assert_eq!(commits["nimbus"], "0123456789abcdef");
        let history = node.history();
        assert!(history.iter().any(|c| c.starts_with("git clone https://github.com/ccp-project/nimbus.git")));
        assert!(history
            .iter()
            .any(|c| c == "cd /tmp/bundler-eval/ccp/nimbus && ~/.cargo/bin/cargo build --release"));
    }
}
