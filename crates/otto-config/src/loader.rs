//! Path resolution and JSON5 config loading.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use otto_core::{Error, ParamDict, ParamValue, Result, Status};
use otto_services::{Service, ServiceContext};

/// A `{class, config}` object from a JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassSpec {
    /// Dotted logical type name, e.g. `otto.env.composite`.
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Resolves file references against an ordered search path and parses JSON
/// with comments.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    paths: Vec<PathBuf>,
}

impl ConfigPaths {
    /// Build the search path: each entry de-duplicated and abs-normalized,
    /// then the current working directory, then the built-in directory.
    pub fn new(config_path: &[PathBuf], builtin: Option<PathBuf>) -> Self {
        let mut paths: Vec<PathBuf> = Vec::new();
        let mut push = |path: PathBuf| {
            let absolute = if path.is_absolute() {
                path
            } else {
                std::env::current_dir().unwrap_or_default().join(path)
            };
            if !paths.contains(&absolute) {
                paths.push(absolute);
            }
        };
        for path in config_path {
            push(path.clone());
        }
        if let Ok(cwd) = std::env::current_dir() {
            push(cwd);
        }
        if let Some(builtin) = builtin {
            push(builtin);
        }
        ConfigPaths { paths }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Resolve a file reference; absolute paths pass through, relative ones
    /// are tried against `extra` dirs first, then the search path.
    pub fn resolve(&self, file: &str, extra: &[PathBuf]) -> PathBuf {
        let candidate = Path::new(file);
        if candidate.is_absolute() {
            return candidate.to_path_buf();
        }
        for dir in extra.iter().chain(&self.paths) {
            let full = dir.join(candidate);
            if full.exists() {
                debug!(file, resolved = %full.display(), "path resolved");
                return full;
            }
        }
        debug!(file, "path not resolved; returning as-is");
        candidate.to_path_buf()
    }

    /// Load a JSON-with-comments config file. A `$schema` field is used only
    /// for validation tooling and is stripped before instantiation.
    pub fn load(&self, file: &str) -> Result<serde_json::Value> {
        let path = self.resolve(file, &[]);
        let text = std::fs::read_to_string(&path).map_err(|err| {
            Error::config(format!("cannot read config {}: {err}", path.display()))
        })?;
        let mut value: serde_json::Value = json5::from_str(&text).map_err(|err| {
            Error::config(format!("malformed config {}: {err}", path.display()))
        })?;
        if let Some(object) = value.as_object_mut() {
            object.remove("$schema");
        }
        Ok(value)
    }

    /// Parse a `{class, config}` object.
    pub fn class_spec(value: &serde_json::Value) -> Result<ClassSpec> {
        serde_json::from_value(strip_schema(value.clone()))
            .map_err(|err| Error::config(format!("not a class object: {err}")))
    }
}

fn strip_schema(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
    }
    value
}

/// Service facade over the path/config loader, exporting the
/// `resolve_path` and `load_config` operations through the uniform
/// parameter-dict contract.
pub struct ConfigLoaderService {
    paths: ConfigPaths,
}

impl ConfigLoaderService {
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigLoaderService { paths }
    }
}

#[async_trait]
impl Service for ConfigLoaderService {
    fn exports(&self) -> Vec<&'static str> {
        vec!["resolve_path", "load_config"]
    }

    async fn invoke(
        &self,
        _ctx: &ServiceContext<'_>,
        op: &str,
        params: &ParamDict,
    ) -> Result<(Status, ParamDict)> {
        let file = params
            .get("path")
            .and_then(ParamValue::as_str)
            .ok_or_else(|| Error::config("missing parameter: path"))?;
        let mut out = params.clone();
        match op {
            "resolve_path" => {
                let resolved = self.paths.resolve(file, &[]);
                out.insert(
                    "resolved_path".into(),
                    ParamValue::Text(resolved.to_string_lossy().into_owned()),
                );
                Ok((Status::Succeeded, out))
            }
            "load_config" => {
                let value = self.paths.load(file)?;
                out.insert("content".into(), ParamValue::Text(value.to_string()));
                Ok((Status::Succeeded, out))
            }
            other => Err(Error::config(format!("unsupported operation: {other}"))),
        }
    }
}
