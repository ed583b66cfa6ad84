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
//! Structured list of commands that are launched together.
//!
//! The traffic of one iteration consists of several clients that must start at (nearly) the same
//! time, and the iteration is done once all of them have terminated. A [`JobList`] describes these
//! commands. How the list is executed is up to the topology: either as a single script inside the
//! link emulator, or as a script executed on a remote machine.

use std::fmt::Write;

/// How a job is started relative to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Run to completion before the next job starts.
    Foreground,
    /// Start in the background. The list only completes once this job terminates.
    Background,
    /// Start in the background and never wait for it.
    Detached,
}

/// A single command of a [`JobList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub command: String,
    pub mode: JobMode,
}

impl Job {
    pub fn foreground(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mode: JobMode::Foreground,
        }
    }

    pub fn background(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mode: JobMode::Background,
        }
    }

    pub fn detached(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mode: JobMode::Detached,
        }
    }
}

/// Ordered list of jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobList {
    jobs: Vec<Job>,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) -> &mut Self {
        self.jobs.push(job);
        self
    }

    pub fn extend(&mut self, jobs: impl IntoIterator<Item = Job>) -> &mut Self {
        self.jobs.extend(jobs);
        self
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Number of jobs that are waited for.
    pub fn num_waited(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.mode == JobMode::Background)
            .count()
    }

    /// Render the list as a bash script that starts all jobs in order, and then waits until every
    /// background job has terminated.
    pub fn render_script(&self) -> String {
        let mut script = String::from("#!/bin/bash\nset -x\n\npids=()\n");
        for job in self.jobs.iter() {
            // writing into a string cannot fail.
            let _ = match job.mode {
                JobMode::Foreground => writeln!(script, "{}", job.command),
                JobMode::Background => writeln!(script, "({}) &\npids+=($!)", job.command),
                JobMode::Detached => writeln!(script, "{} &", job.command),
            };
        }
        script.push_str("\nfor pid in ${pids[*]}; do\n    wait $pid\ndone\n");
        script
    }
}

impl FromIterator<Job> for JobList {
    fn from_iter<T: IntoIterator<Item = Job>>(iter: T) -> Self {
        Self {
            jobs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn script_waits_on_background_jobs() {
        let mut jobs = JobList::new();
        jobs.push(Job::detached("sudo outbox --iface ingress > outbox.log 2>&1"))
            .push(Job::foreground("sleep 1"))
            .push(Job::background("iperf -c 10.0.0.1 -p 5001 > iperf_client_5001.out"))
            .push(Job::background("iperf -c $MAHIMAHI_BASE -p 4001 > iperf_client_4001.out"));
        assert_eq!(jobs.num_waited(), 2);

        let script = jobs.render_script();
        assert_eq!(
            script,
            "#!/bin/bash\nset -x\n\npids=()\n\
             sudo outbox --iface ingress > outbox.log 2>&1 &\n\
             sleep 1\n\
             (iperf -c 10.0.0.1 -p 5001 > iperf_client_5001.out) &\npids+=($!)\n\
             (iperf -c $MAHIMAHI_BASE -p 4001 > iperf_client_4001.out) &\npids+=($!)\n\
             \nfor pid in ${pids[*]}; do\n    wait $pid\ndone\n"
        );
    }

    #[test]
    fn empty_script_terminates() {
        let script = JobList::new().render_script();
        assert!(script.ends_with("done\n"));
        assert!(!script.contains("pids+="));
    }
}
