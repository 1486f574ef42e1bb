use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::RawManifest;

/// Where manifests come from. Implementations may read files, query a
/// remote catalogue or hold them in memory.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn manifests(&self) -> Result<Vec<RawManifest>>;
}

/// Manifests held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticManifestSource {
    manifests: Vec<RawManifest>,
}

impl StaticManifestSource {
    pub fn new(manifests: Vec<RawManifest>) -> Self {
        Self { manifests }
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn manifests(&self) -> Result<Vec<RawManifest>> {
        Ok(self.manifests.clone())
    }
}

/// Manifests read from `.toml` and `.json` files.
///
/// Relative file entries are resolved against the directory of the manifest
/// file that declares them.
#[derive(Debug, Clone)]
pub struct FileManifestSource {
    paths: Vec<PathBuf>,
}

impl FileManifestSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn manifests(&self) -> Result<Vec<RawManifest>> {
        load_manifests(&self.paths)
    }
}

/// Parse manifests from configuration files, rejecting duplicate ids.
pub fn load_manifests(manifest_files: &[PathBuf]) -> Result<Vec<RawManifest>> {
    let mut manifests = Vec::new();
    for path in manifest_files {
        let parsed = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => parse_toml_file(path)?,
            Some("json") => parse_json_file(path)?,
            Some(_) => return Err(anyhow::anyhow!("Unsupported file type: {}", path.display())),
            None => {
                return Err(anyhow::anyhow!(
                    "File without extension: {}",
                    path.display()
                ));
            }
        };
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        manifests.extend(parsed.into_iter().map(|m| rebase_entry(m, base)));
    }

    // Collision detection - ensure unique ids across all files
    let mut ids = HashSet::new();
    for manifest in &manifests {
        if !manifest.id.is_empty() && !ids.insert(manifest.id.as_str()) {
            return Err(anyhow::anyhow!("Duplicate manifest id: '{}'", manifest.id));
        }
    }
    Ok(manifests)
}

fn rebase_entry(mut manifest: RawManifest, base: &Path) -> RawManifest {
    let entry = manifest.entry.trim();
    if entry.is_empty() || entry.contains("://") {
        return manifest;
    }
    let path = Path::new(entry);
    if path.is_relative() && !base.as_os_str().is_empty() {
        manifest.entry = base.join(path).to_string_lossy().to_string();
    }
    manifest
}

fn parse_json_file(path: &Path) -> Result<Vec<RawManifest>> {
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse '{}': {e}", path.display()))?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value(item).map_err(|e| {
                    anyhow::anyhow!("Failed to parse manifest {i} in '{}': {e}", path.display())
                })
            })
            .collect(),
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(value).map_err(|e| {
            anyhow::anyhow!("Failed to parse manifest in '{}': {e}", path.display())
        })?]),
        _ => Err(anyhow::anyhow!(
            "JSON file must contain a manifest object or an array of manifests: {}",
            path.display()
        )),
    }
}

/// A TOML file holds either one manifest at root level, or one table per
/// manifest keyed by module id.
fn parse_toml_file(path: &Path) -> Result<Vec<RawManifest>> {
    let content = fs::read_to_string(path)?;
    let toml_doc: toml::Value = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse '{}': {e}", path.display()))?;

    let toml::Value::Table(table) = toml_doc else {
        return Err(anyhow::anyhow!(
            "TOML file must contain a table at root level"
        ));
    };

    if table.contains_key("id") || table.contains_key("entry") {
        return Ok(vec![manifest_from_table(&table, None)?]);
    }

    let mut manifests = Vec::new();
    for (name, value) in &table {
        if let toml::Value::Table(def_table) = value {
            manifests.push(manifest_from_table(def_table, Some(name))?);
        } else {
            return Err(anyhow::anyhow!("Manifest '{name}' must be a table"));
        }
    }
    Ok(manifests)
}

fn manifest_from_table(
    table: &toml::map::Map<String, toml::Value>,
    name: Option<&str>,
) -> Result<RawManifest> {
    let mut json = convert_toml_table_to_json_map(table)?;
    if let Some(name) = name {
        match json.get("id").and_then(|v| v.as_str()) {
            Some(id) if id != name => {
                return Err(anyhow::anyhow!(
                    "Manifest table '{name}' declares a different id '{id}'"
                ));
            }
            Some(_) => {}
            None => {
                json.insert("id".to_string(), serde_json::Value::String(name.to_string()));
            }
        }
    }
    let label = name.unwrap_or("<root>");
    serde_json::from_value(serde_json::Value::Object(json))
        .map_err(|e| anyhow::anyhow!("Failed to parse manifest '{label}': {e}"))
}

fn convert_toml_table_to_json_map(
    table: &toml::map::Map<String, toml::Value>,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut map = serde_json::Map::new();
    for (key, value) in table {
        let json_value = convert_toml_value_to_json(value)?;
        map.insert(key.clone(), json_value);
    }
    Ok(map)
}

fn convert_toml_value_to_json(value: &toml::Value) -> Result<serde_json::Value> {
    match value {
        toml::Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        toml::Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        toml::Value::Float(f) => Ok(serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        toml::Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        toml::Value::Array(arr) => {
            let json_arr: Result<Vec<_>, _> = arr.iter().map(convert_toml_value_to_json).collect();
            Ok(serde_json::Value::Array(json_arr?))
        }
        toml::Value::Table(table) => Ok(serde_json::Value::Object(
            convert_toml_table_to_json_map(table)?,
        )),
        toml::Value::Datetime(dt) => Ok(serde_json::Value::String(dt.to_string())),
    }
}
