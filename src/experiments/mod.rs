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
//! Module describing the experiments of a sweep, and running them on the testbed.

pub mod runner;
pub mod setup;
pub mod sweep;

use std::{collections::BTreeMap, fmt};

use itertools::Itertools;
use serde::Deserialize;

use crate::{
    config::{render_value, ConfigError},
    traffic::{TrafficPattern, TrafficSpec},
};

/// Name of the algorithm that disables the inbox entirely.
pub const BASELINE: &str = "nobundler";

/// The axes of the sweep, in the order in which they describe an experiment.
pub const AXES: [&str; 8] = [
    "seed",
    "sch",
    "alg",
    "rate",
    "rtt",
    "bdp",
    "bundle_traffic",
    "cross_traffic",
];

/// Link rate in Mbps.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Rate(pub f64);

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Mbps", self.0)
    }
}

impl Rate {
    /// Bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        self.0 * 1_000_000.0 / 8.0
    }
}

/// Round-trip time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rtt(pub u32);

impl fmt::Display for Rtt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Queue size of the emulated link, in bandwidth-delay products.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferSize {
    Bdp(f64),
    Infinite,
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSize::Bdp(x) => write!(f, "{x}"),
            BufferSize::Infinite => f.write_str("inf"),
        }
    }
}

/// Algorithm under test, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Algorithm {
    pub name: String,
    /// Parameters, sorted by name.
    pub params: BTreeMap<String, toml::Value>,
}

impl Algorithm {
    pub fn is_baseline(&self) -> bool {
        self.name == BASELINE
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in self.params.iter() {
            write!(f, ".{k}={}", render_value(v))?;
        }
        Ok(())
    }
}

/// One point of the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub seed: u64,
    pub sch: String,
    pub alg: Algorithm,
    pub rate: Rate,
    pub rtt: Rtt,
    pub bdp: BufferSize,
    pub bundle_traffic: Vec<TrafficPattern>,
    pub cross_traffic: Vec<TrafficPattern>,
}

fn parse_seed(v: &toml::Value) -> Result<u64, ConfigError> {
    v.as_integer()
        .and_then(|x| u64::try_from(x).ok())
        .ok_or_else(|| ConfigError::axis("seed", format!("expected a non-negative integer, got {v}")))
}

fn parse_sch(v: &toml::Value) -> Result<String, ConfigError> {
    match v.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(ConfigError::axis("sch", format!("expected a scheduler name, got {v}"))),
    }
}

/// Parse a number with an optional unit suffix (`48`, `48.5`, `"48Mbps"`).
fn parse_with_unit(axis: &str, v: &toml::Value, unit: &str) -> Result<f64, ConfigError> {
    let x = match v {
        toml::Value::Integer(x) => Some(*x as f64),
        toml::Value::Float(x) => Some(*x),
        toml::Value::String(s) => {
            let s = s.trim();
            let s = s
                .strip_suffix(unit)
                .or_else(|| s.strip_suffix(&unit.to_lowercase()))
                .unwrap_or(s);
            s.trim().parse().ok()
        }
        _ => None,
    };
    match x {
        Some(x) if x.is_finite() && x > 0.0 => Ok(x),
        _ => Err(ConfigError::axis(
            axis,
            format!("expected a positive number (optionally with unit {unit}), got {v}"),
        )),
    }
}

fn parse_rate(v: &toml::Value) -> Result<Rate, ConfigError> {
    parse_with_unit("rate", v, "Mbps").map(Rate)
}

fn parse_rtt(v: &toml::Value) -> Result<Rtt, ConfigError> {
    let x = parse_with_unit("rtt", v, "ms")?;
    if x.fract() != 0.0 || x > u32::MAX as f64 {
        return Err(ConfigError::axis("rtt", format!("expected whole milliseconds, got {v}")));
    }
    Ok(Rtt(x as u32))
}

fn parse_bdp(v: &toml::Value) -> Result<BufferSize, ConfigError> {
    match v {
        toml::Value::String(s) if s == "inf" => Ok(BufferSize::Infinite),
        _ => parse_with_unit("bdp", v, "bdp").map(BufferSize::Bdp),
    }
}

fn parse_alg(v: &toml::Value) -> Result<Algorithm, ConfigError> {
    let table = v
        .as_table()
        .ok_or_else(|| ConfigError::axis("alg", format!("expected a table, got {v}")))?;
    let name = table
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| ConfigError::axis("alg", "algs must have key name"))?
        .to_string();
    let params = table
        .iter()
        .filter(|(k, _)| *k != "name")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok(Algorithm { name, params })
}

pub(crate) fn parse_traffic(axis: &str, v: &toml::Value) -> Result<Vec<TrafficPattern>, ConfigError> {
    Vec::<TrafficPattern>::deserialize(v.clone()).map_err(|e| ConfigError::axis(axis, e))
}

impl ExperimentConfig {
    /// Check a single (fully expanded) value of an axis.
    pub fn check_value(axis: &str, v: &toml::Value) -> Result<(), ConfigError> {
        match axis {
            "seed" => parse_seed(v).map(|_| ()),
            "sch" => parse_sch(v).map(|_| ()),
            "alg" => parse_alg(v).map(|_| ()),
            "rate" => parse_rate(v).map(|_| ()),
            "rtt" => parse_rtt(v).map(|_| ()),
            "bdp" => parse_bdp(v).map(|_| ()),
            "bundle_traffic" | "cross_traffic" => parse_traffic(axis, v).map(|_| ()),
            _ => Err(ConfigError::axis(axis, "unknown experiment axis")),
        }
    }

    /// Build the experiment from one point of the sweep.
    pub fn from_point(point: &[(String, toml::Value)]) -> Result<Self, ConfigError> {
        let get = |axis: &str| {
            point
                .iter()
                .find(|(k, _)| k == axis)
                .map(|(_, v)| v)
                .ok_or_else(|| ConfigError::axis(axis, "missing experiment axis"))
        };
        if let Some((k, _)) = point.iter().find(|(k, _)| !AXES.contains(&k.as_str())) {
            return Err(ConfigError::axis(k.as_str(), "unknown experiment axis"));
        }
        Ok(Self {
            seed: parse_seed(get("seed")?)?,
            sch: parse_sch(get("sch")?)?,
            alg: parse_alg(get("alg")?)?,
            rate: parse_rate(get("rate")?)?,
            rtt: parse_rtt(get("rtt")?)?,
            bdp: parse_bdp(get("bdp")?)?,
            bundle_traffic: parse_traffic("bundle_traffic", get("bundle_traffic")?)?,
            cross_traffic: parse_traffic("cross_traffic", get("cross_traffic")?)?,
        })
    }

    pub fn bundle_specs(&self) -> Vec<TrafficSpec> {
        self.bundle_traffic
            .iter()
            .map(|t| TrafficSpec::from_pattern(t, self.rate, self.seed))
            .collect()
    }

    pub fn cross_specs(&self) -> Vec<TrafficSpec> {
        self.cross_traffic
            .iter()
            .map(|t| TrafficSpec::from_pattern(t, self.rate, self.seed))
            .collect()
    }

    /// The baseline is only run with the schedulers that exist without the inbox.
    pub fn is_supported(&self) -> bool {
        !self.alg.is_baseline() || matches!(self.sch.as_str(), "fifo" | "sfq")
    }

    /// Relative path of the iteration directory. Equal experiments always have the same name, and
    /// experiments that differ in any field have different names.
    pub fn iteration_name(&self) -> String {
        format!(
            "{}_{}_{}_{}bdp/{}/b={}_c={}/{}",
            self.sch,
            self.rate,
            self.rtt,
            self.bdp,
            self.alg,
            self.bundle_specs().iter().join("+"),
            self.cross_specs().iter().join("+"),
            self.seed
        )
    }
}

impl fmt::Display for ExperimentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seed={} sch={} alg={} rate={} rtt={} bdp={} bundle=[{}] cross=[{}]",
            self.seed,
            self.sch,
            self.alg,
            self.rate,
            self.rtt,
            self.bdp,
            self.bundle_specs().iter().join(", "),
            self.cross_specs().iter().join(", "),
        )
    }
}
