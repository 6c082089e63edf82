//! Repository configuration (`.ffbox/config.json`).
//!
//! Lives inside the pushed tree, not on the mounting host. The only consumer
//! is the push path: `scripts.example_run` (or `scripts.run`) names the
//! command traced to produce the read-order log, and `exclude` lists glob
//! patterns left out of the upload.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::readorder::META_DIR;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub scripts: Scripts,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scripts {
    pub run: Option<String>,
    pub example_run: Option<String>,
}

impl RepoConfig {
    /// Load `<repo_root>/.ffbox/config.json`. A missing file is not an
    /// error; it yields the default (no scripts, no excludes).
    pub fn load(repo_root: &Path) -> anyhow::Result<RepoConfig> {
        let path = repo_root.join(META_DIR).join(CONFIG_FILE);
        if !path.exists() {
            return Ok(RepoConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    }

    /// The command to execute under tracing: `example_run` wins over `run`.
    pub fn trace_command(&self) -> Option<&str> {
        self.scripts
            .example_run
            .as_deref()
            .or(self.scripts.run.as_deref())
    }
}
