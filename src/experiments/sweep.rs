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
//! Expansion of the sweep axes into the list of experiments.
//!
//! The configuration declares a list of values for every axis. The sweep is the cartesian product
//! of all axes. If a chosen value is itself a table with list-valued fields (like an algorithm
//! with several parameter values), the table is expanded into the cartesian product of those
//! fields, such that every parameter combination becomes its own experiment.

use itertools::Itertools;
use rand::{seq::SliceRandom, thread_rng};

use super::{ExperimentConfig, AXES};
use crate::config::ConfigError;

/// Axes of the sweep, in declaration order.
pub type Axes = Vec<(String, Vec<toml::Value>)>;
/// One combination of axis values, in declaration order.
pub type Point = Vec<(String, toml::Value)>;

/// Read the axes from the `[experiment]` table. Every axis must be a non-empty list.
pub fn axes(table: &toml::Table) -> Result<Axes, ConfigError> {
    table
        .iter()
        .map(|(k, v)| match v.as_array() {
            Some(vs) if !vs.is_empty() => Ok((k.clone(), vs.clone())),
            _ => Err(ConfigError::axis(
                k.as_str(),
                "must specify a non-empty list of values",
            )),
        })
        .collect()
}

/// Cartesian product of all axes.
pub fn product(axes: &Axes) -> Vec<Point> {
    if axes.is_empty() {
        return vec![Vec::new()];
    }
    axes.iter()
        .map(|(_, vs)| vs.iter())
        .multi_cartesian_product()
        .map(|values| {
            axes.iter()
                .map(|(k, _)| k.clone())
                .zip(values.into_iter().cloned())
                .collect()
        })
        .collect()
}

/// Expand the list-valued fields of a table. A table without list-valued fields expands to
/// itself, and one with an empty list to nothing ([`check_axes`] rejects those). Field order is
/// preserved.
pub fn expand_table(table: &toml::Table) -> Vec<toml::Table> {
    let lists: Vec<(&String, &Vec<toml::Value>)> = table
        .iter()
        .filter_map(|(k, v)| v.as_array().map(|vs| (k, vs)))
        .collect();
    if lists.is_empty() {
        return vec![table.clone()];
    }
    if lists.iter().any(|(_, vs)| vs.is_empty()) {
        return Vec::new();
    }
    lists
        .iter()
        .map(|(_, vs)| vs.iter())
        .multi_cartesian_product()
        .map(|choice| {
            let mut t = table.clone();
            for ((k, _), v) in lists.iter().zip(choice) {
                t.insert((*k).clone(), v.clone());
            }
            t
        })
        .collect()
}

/// Replace every table-valued entry of the point by its expansion.
pub fn expand_nested(point: Point) -> Vec<Point> {
    let options: Vec<Vec<toml::Value>> = point
        .iter()
        .map(|(_, v)| match v {
            toml::Value::Table(t) => expand_table(t).into_iter().map(toml::Value::Table).collect(),
            v => vec![v.clone()],
        })
        .collect();
    if options.is_empty() {
        return vec![point];
    }
    options
        .iter()
        .map(|vs| vs.iter())
        .multi_cartesian_product()
        .map(|values| {
            point
                .iter()
                .map(|(k, _)| k.clone())
                .zip(values.into_iter().cloned())
                .collect()
        })
        .collect()
}

/// All points of the sweep, in a stable order.
pub fn expand(axes: &Axes) -> Vec<Point> {
    product(axes).into_iter().flat_map(expand_nested).collect()
}

/// Check that the `[experiment]` table declares every axis, and that every value is valid.
pub fn check_axes(table: &toml::Table) -> Result<(), ConfigError> {
    for axis in AXES {
        if !table.contains_key(axis) {
            return Err(ConfigError::axis(axis, "must specify at least one value"));
        }
    }
    for (axis, values) in axes(table)? {
        for value in values {
            if let toml::Value::Table(t) = &value {
                let empty = t
                    .iter()
                    .find(|(_, v)| v.as_array().is_some_and(|vs| vs.is_empty()));
                if let Some((field, _)) = empty {
                    return Err(ConfigError::axis(
                        axis.as_str(),
                        format!("{field} must specify a non-empty list of values"),
                    ));
                }
            }
            let expanded = match &value {
                toml::Value::Table(t) => expand_table(t).into_iter().map(toml::Value::Table).collect(),
                v => vec![v.clone()],
            };
            for v in expanded.iter() {
                ExperimentConfig::check_value(&axis, v)?;
            }
        }
    }
    Ok(())
}

/// All experiments of the sweep, in a stable order.
pub fn experiments(table: &toml::Table) -> Result<Vec<ExperimentConfig>, ConfigError> {
    check_axes(table)?;
    expand(&axes(table)?)
        .iter()
        .map(|p| ExperimentConfig::from_point(p))
        .collect()
}

/// All experiments of the sweep, randomly shuffled. An interrupted sweep has then explored a
/// representative subset of the experiments.
///
/// The table must declare every axis in [`AXES`]. Tables with other axes are expanded with
/// [`axes`] and [`expand`].
pub fn enumerate(table: &toml::Table) -> Result<Vec<ExperimentConfig>, ConfigError> {
    let mut exps = experiments(table)?;
    exps.shuffle(&mut thread_rng());
    log::debug!("Enumerated {} experiments", exps.len());
    Ok(exps)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::config::{test::EMULATED, Config};

    #[test]
    fn twelve_combinations() {
        let table: toml::Table = toml::from_str(
            r#"
seed = [0, 17]
rate = ["48Mbps", "60Mbps"]
alg = [{ name = "nimbus", alpha = [0, 1] }, { name = "bbr" }]
"#,
        )
        .unwrap();
        let points = expand(&axes(&table).unwrap());
        assert_eq!(points.len(), 12);

        let unique: HashSet<String> = points
            .iter()
            .map(|p| toml::Value::Table(p.iter().cloned().collect()).to_string())
            .collect();
        assert_eq!(unique.len(), 12);

        // keys keep their declaration order
        assert!(points
            .iter()
            .all(|p| p.iter().map(|(k, _)| k.as_str()).eq(["seed", "rate", "alg"])));
        let nimbus = points
            .iter()
            .filter(|p| p[2].1.get("name").and_then(|n| n.as_str()) == Some("nimbus"))
            .count();
        assert_eq!(nimbus, 8);

        // an experiment needs all of its axes
        assert!(enumerate(&table).is_err());
    }

    #[test]
    fn nested_tables_keep_field_order() {
        let t: toml::Table = toml::from_str("name = \"nimbus\"\nalpha = [0, 1]\nmode = \"xtcp\"\nbeta = [2, 3, 4]").unwrap();
        let expanded = expand_table(&t);
        assert_eq!(expanded.len(), 6);
        assert!(expanded
            .iter()
            .all(|t| t.keys().map(String::as_str).eq(["name", "alpha", "mode", "beta"])));
    }

    #[test]
    fn enumerate_config() {
        let config = Config::parse(EMULATED).unwrap();
        let exps = enumerate(&config.experiment).unwrap();
        assert_eq!(exps.len(), 2);
        let names: HashSet<String> = exps.iter().map(|e| e.iteration_name()).collect();
        assert_eq!(
            names,
            HashSet::from([
                "fifo_48Mbps_50ms_2bdp/nimbus.alpha=0/b=iperf.cubic.1_c=/0".to_string(),
                "fifo_48Mbps_50ms_2bdp/nimbus.alpha=1/b=iperf.cubic.1_c=/0".to_string(),
            ])
        );
    }

    #[test]
    fn empty_and_unknown_axes() {
        let config = Config::parse(EMULATED).unwrap();
        let mut table = config.experiment.clone();
        table.insert("rate".into(), toml::Value::Array(vec![]));
        assert!(check_axes(&table).is_err());

        let mut table = config.experiment.clone();
        table.insert("speed".into(), toml::Value::Array(vec![toml::Value::Integer(1)]));
        assert!(check_axes(&table).is_err());

        let mut table = config.experiment.clone();
        table.remove("seed");
        assert!(check_axes(&table).is_err());

        // an empty parameter list would silently drop the algorithm
        let mut table = config.experiment;
        let alg: toml::Table = toml::from_str("name = \"nimbus\"\nalpha = []").unwrap();
        table.insert(
            "alg".into(),
            toml::Value::Array(vec![toml::Value::Table(alg)]),
        );
        let err = check_axes(&table).unwrap_err();
        assert!(err.to_string().contains("alpha must specify"), "{err}");
    }
}
