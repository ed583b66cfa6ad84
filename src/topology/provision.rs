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
//! Provisioning of cluster machines by an external service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;

use super::{Machine, Role};
use crate::EvalError;

lazy_static! {
    static ref SSH_URL: Regex =
        Regex::new(r"ssh -p (?P<port>[0-9]+) (?P<user>[A-Za-z0-9_\-]+)@(?P<name>[A-Za-z0-9\.\-]+)")
            .unwrap();
}

/// Connection descriptor of a provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshUrl {
    pub port: u16,
    pub user: String,
    pub name: String,
}

impl From<SshUrl> for Machine {
    fn from(value: SshUrl) -> Self {
        Machine {
            name: value.name,
            user: Some(value.user),
            port: Some(value.port),
            is_self: false,
            ifaces: Vec::new(),
        }
    }
}

/// Extract all `ssh -p <port> <user>@<host>` descriptors from the text.
pub fn parse_ssh_urls(text: &str) -> Vec<SshUrl> {
    SSH_URL
        .captures_iter(text)
        .filter_map(|c| {
            Some(SshUrl {
                port: c.name("port")?.as_str().parse().ok()?,
                user: c.name("user")?.as_str().to_string(),
                name: c.name("name")?.as_str().to_string(),
            })
        })
        .collect()
}

/// A service that hands out machines.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Machines of a resource that was provisioned earlier, if any.
    async fn existing(&self) -> Result<Vec<SshUrl>, EvalError>;

    /// Provision a new resource and return its machines.
    async fn launch(&self) -> Result<Vec<SshUrl>, EvalError>;
}

/// Provisioner that calls a local command, which prints the ssh descriptors of the machines.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: String,
    dry: bool,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>, dry: bool) -> Self {
        Self {
            command: command.into(),
            dry,
        }
    }

    async fn call(&self, action: &str) -> Result<Vec<SshUrl>, EvalError> {
        log::debug!("{} {action}", self.command);
        let out = Command::new("sh")
            .arg("-c")
            .arg(format!("{} {action}", self.command))
            .output()
            .await?;
        if !out.status.success() {
            return Err(EvalError::Provision(format!(
                "`{} {action}` exited with {:?}: {}",
                self.command,
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(parse_ssh_urls(&String::from_utf8_lossy(&out.stdout)))
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn existing(&self) -> Result<Vec<SshUrl>, EvalError> {
        self.call("existing").await
    }

    async fn launch(&self) -> Result<Vec<SshUrl>, EvalError> {
        if self.dry {
            return Err(EvalError::Provision(
                "no existing cluster found, and launching one is not possible in a dry run".to_string(),
            ));
        }
        self.call("launch").await
    }
}

/// Reuse the existing resource if there is one, and provision a new one otherwise.
pub async fn provision(p: &(impl Provisioner + ?Sized)) -> Result<Vec<SshUrl>, EvalError> {
    log::info!("Check for existing cluster");
    let machines = p.existing().await?;
    if !machines.is_empty() {
        log::info!("Existing cluster found");
        return Ok(machines);
    }
    log::info!("Launch new cluster");
    p.launch().await
}

/// Bind provisioned machines to roles, in the order sender, inbox, outbox, receiver. With only
/// three machines, outbox and receiver share the last one.
pub fn assign_roles(urls: Vec<SshUrl>) -> Result<BTreeMap<Role, Machine>, EvalError> {
    let mut urls = urls.into_iter();
    let (Some(sender), Some(inbox), Some(outbox)) = (urls.next(), urls.next(), urls.next()) else {
        return Err(EvalError::Provision(
            "the cluster must have at least 3 machines".to_string(),
        ));
    };
    let receiver = urls.next().unwrap_or_else(|| outbox.clone());
    for (role, url) in [
        (Role::Sender, &sender),
        (Role::Inbox, &inbox),
        (Role::Outbox, &outbox),
        (Role::Receiver, &receiver),
    ] {
        log::debug!("[{role}] ssh -p {} {}@{}", url.port, url.user, url.name);
    }
    Ok(BTreeMap::from([
        (Role::Sender, sender.into()),
        (Role::Inbox, inbox.into()),
        (Role::Outbox, outbox.into()),
        (Role::Receiver, receiver.into()),
    ]))
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub(crate) struct FakeProvisioner {
        pub existing: Vec<SshUrl>,
        pub launched: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn existing(&self) -> Result<Vec<SshUrl>, EvalError> {
            Ok(self.existing.clone())
        }

        async fn launch(&self) -> Result<Vec<SshUrl>, EvalError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(parse_ssh_urls(
                "ssh -p 22 eval@hp1.utah.cloudlab.us\nssh -p 22 eval@hp2.utah.cloudlab.us\nssh -p 22 eval@hp3.utah.cloudlab.us",
            ))
        }
    }

    #[test]
    fn parse_urls() {
        let urls = parse_ssh_urls(
            "node0 ssh -p 22 roschmi@c220g2-011.wisc.cloudlab.us\nnode1 ssh -p 2222 roschmi@c220g2-012.wisc.cloudlab.us\ngarbage",
        );
        assert_eq!(
            urls,
            vec![
                SshUrl {
                    port: 22,
                    user: "roschmi".into(),
                    name: "c220g2-011.wisc.cloudlab.us".into()
                },
                SshUrl {
                    port: 2222,
                    user: "roschmi".into(),
                    name: "c220g2-012.wisc.cloudlab.us".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn existing_cluster_is_reused() {
        let p = FakeProvisioner {
            existing: parse_ssh_urls("ssh -p 22 a@x1\nssh -p 22 a@x2\nssh -p 22 a@x3\nssh -p 22 a@x4"),
            launched: AtomicUsize::new(0),
        };
        let urls = provision(&p).await.unwrap();
        assert_eq!(urls.len(), 4);
        assert_eq!(p.launched.load(Ordering::SeqCst), 0);

        let roles = assign_roles(urls).unwrap();
        assert_eq!(roles[&Role::Receiver].name, "x4");
    }

    #[tokio::test]
    async fn launch_if_none_exists() {
        let p = FakeProvisioner {
            existing: Vec::new(),
            launched: AtomicUsize::new(0),
        };
        let urls = provision(&p).await.unwrap();
        assert_eq!(p.launched.load(Ordering::SeqCst), 1);
        let roles = assign_roles(urls).unwrap();
        assert_eq!(roles[&Role::Outbox], roles[&Role::Receiver]);

        assert!(assign_roles(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn dry_run_never_launches() {
        let p = CommandProvisioner::new("true", true);
        assert!(p.existing().await.unwrap().is_empty());
        assert!(matches!(p.launch().await, Err(EvalError::Provision(_))));
    }
}
