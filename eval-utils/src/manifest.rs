//! Version manifest stored next to the results of an experiment.

use std::{collections::BTreeMap, io::Write, path::Path};

use serde::{Deserialize, Serialize};

use crate::other::get_timestamp;

/// Records which code versions produced the results of an experiment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionManifest {
    /// When the manifest was written.
    pub created: String,
    /// Name of the experiment.
    pub experiment: String,
    /// component name -> checked-out commit
    pub commits: BTreeMap<String, String>,
}

impl VersionManifest {
    pub fn new(experiment: impl Into<String>) -> Self {
        Self {
            created: get_timestamp(),
            experiment: experiment.into(),
            commits: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, component: impl Into<String>, commit: impl AsRef<str>) {
        self.commits
            .insert(component.into(), commit.as_ref().trim().to_string());
    }

    /// Serialize the manifest and store it at the given file location, overwriting an existing
    /// file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let serialized = serde_json::to_string_pretty(self)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}
