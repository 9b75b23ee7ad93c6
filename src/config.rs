//! The task-configuration file (`spec.md` §6): a JSON-with-comments document
//! at the repo root, and optionally per package, describing the pipeline.

use std::collections::BTreeMap;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use jsonc_parser::{ParseOptions, parse_to_serde_value};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    fs,
    path::{AbsDirPath, TryJoinWith as _},
    task::TaskDefinition,
};

/// `remoteCache` top-level key (`spec.md` §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub team_id: Option<String>,
    pub signature: bool,
}

/// The parsed contents of a `monorail.json`/`monorail.jsonc` document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub global_dependencies: Vec<String>,
    pub global_env: Vec<String>,
    pub pipeline: BTreeMap<String, TaskDefinition>,
    pub remote_cache: RemoteCacheConfig,
}

const CONFIG_BASENAMES: [&str; 2] = ["monorail.json", "monorail.jsonc"];

/// Load the task-configuration file from a directory, if present.
///
/// Fails if both `monorail.json` and `monorail.jsonc` exist at the same location
/// (`spec.md` §6: "presence of both at the same location is a fatal
/// configuration error").
#[instrument]
pub async fn load_config(dir: &AbsDirPath) -> Result<Option<PipelineConfig>> {
    let mut found = Vec::new();
    for basename in CONFIG_BASENAMES {
        let path = dir.try_join_file(basename)?;
        if fs::exists(path.as_std_path()).await {
            found.push(path);
        }
    }

    match found.as_slice() {
        [] => Ok(None),
        [path] => parse_config_file(path).await.map(Some),
        [a, b, ..] => bail!(
            "ambiguous task configuration: both {a} and {b} exist at {dir}; remove one"
        ),
    }
}

async fn parse_config_file(path: &crate::path::AbsFilePath) -> Result<PipelineConfig> {
    let text = fs::must_read_buffered_utf8(path).await?;
    let value = parse_to_serde_value(&text, &ParseOptions::default())
        .with_context(|| format!("parse {path} as JSON-with-comments"))?
        .ok_or_else(|| eyre!("{path} contained no JSON value"))?;
    serde_json::from_value(value).with_context(|| format!("deserialize pipeline config from {path}"))
}

/// Compose a root pipeline config with a package-local override.
///
/// Per `spec.md` §3: "Overrides replace, not merge, individual fields" — a
/// package's `pipeline.<task>` entry, if present, entirely replaces the
/// root definition for that task; tasks the package doesn't mention keep
/// the root's definition verbatim.
pub fn compose(root: &PipelineConfig, package_override: Option<&PipelineConfig>) -> BTreeMap<String, TaskDefinition> {
    let mut pipeline = root.pipeline.clone();
    if let Some(over) = package_override {
        for (task, def) in &over.pipeline {
            pipeline.insert(task.clone(), def.clone());
        }
    }
    pipeline
}

/// Warn (but do not fail) when a package config declares keys that only
/// make sense at the repo root, mirroring the teacher's posture of logging
/// non-fatal configuration oddities rather than rejecting them outright.
pub fn warn_on_root_only_keys(dir: &AbsDirPath, config: &PipelineConfig) {
    if !config.global_dependencies.is_empty() || !config.global_env.is_empty() {
        warn!(%dir, "globalDependencies/globalEnv are only honored in the repo-root configuration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_pipeline() {
        let raw = r#"{
            // a comment, since this is JSON-with-comments
            "pipeline": {
                "build": { "outputs": ["dist/**"] }
            }
        }"#;
        let value = parse_to_serde_value(raw, &ParseOptions::default())
            .unwrap()
            .unwrap();
        let config: PipelineConfig = serde_json::from_value(value).unwrap();
        assert_eq!(
            config.pipeline["build"].outputs,
            Some(vec!["dist/**".to_owned()])
        );
    }

    #[test]
    fn compose_override_replaces_wholesale() {
        let mut root = PipelineConfig::default();
        root.pipeline.insert(
            "build".to_owned(),
            TaskDefinition {
                outputs: Some(vec!["dist/**".to_owned()]),
                cache: true,
                ..TaskDefinition::default()
            },
        );
        let mut over = PipelineConfig::default();
        over.pipeline.insert(
            "build".to_owned(),
            TaskDefinition {
                outputs: None,
                cache: false,
                ..TaskDefinition::default()
            },
        );
        let composed = compose(&root, Some(&over));
        assert!(!composed["build"].cache);
        assert_eq!(composed["build"].outputs, None);
    }
}
