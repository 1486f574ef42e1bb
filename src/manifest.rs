//! Manifest validation.
//!
//! Validation is pure: it never consults the registry, so the same raw
//! manifest always produces the same result.

use std::collections::{BTreeSet, HashSet};

use crate::error::ValidationError;
use crate::types::{DependencySpec, Manifest, RawManifest, SharingStrategy};
use crate::version::VersionRange;

/// Name under which the event bus is injected into every module scope.
pub const EVENT_BUS_CAPABILITY: &str = "event-bus";

/// Owner id of subscriptions made by the host itself. Module ids may not
/// start with `@`, so no module unload can remove them.
pub const HOST_OWNER: &str = "@host";

const RESERVED_ID_PREFIX: char = '@';

/// Names that always resolve to one process-wide instance.
pub const DEFAULT_PROCESS_SINGLETONS: &[&str] = &[EVENT_BUS_CAPABILITY];

/// Knobs the validator consults. The default policy only protects the event
/// bus.
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    process_singletons: BTreeSet<String>,
}

impl ValidationPolicy {
    pub fn new<I, S>(process_singletons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut policy = Self::default();
        policy
            .process_singletons
            .extend(process_singletons.into_iter().map(Into::into));
        policy
    }

    pub fn is_process_singleton(&self, name: &str) -> bool {
        self.process_singletons.contains(name)
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            process_singletons: DEFAULT_PROCESS_SINGLETONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Validate a raw manifest against the default policy.
pub fn validate(raw: &RawManifest) -> Result<Manifest, ValidationError> {
    validate_with(raw, &ValidationPolicy::default())
}

/// Validate a raw manifest against the given policy.
pub fn validate_with(
    raw: &RawManifest,
    policy: &ValidationPolicy,
) -> Result<Manifest, ValidationError> {
    let id = require_field(&raw.id, "id")?;
    if id.starts_with(RESERVED_ID_PREFIX) {
        return Err(ValidationError::ReservedId(id.to_string()));
    }
    let entry = require_field(&raw.entry, "entry")?;
    let version_str = require_field(&raw.version, "version")?;

    let version =
        semver::Version::parse(version_str).map_err(|e| ValidationError::InvalidVersion {
            version: version_str.to_string(),
            reason: e.to_string(),
        })?;

    let mut seen = HashSet::new();
    let mut dependencies = Vec::with_capacity(raw.dependencies.len());
    for (position, dep) in raw.dependencies.iter().enumerate() {
        let name = dep.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyDependencyName(position));
        }
        if !seen.insert(name) {
            return Err(ValidationError::DuplicateDependency(name.to_string()));
        }

        let range = dep.version_range.trim();
        let requirement = if range.is_empty() {
            semver::VersionReq::STAR
        } else {
            semver::VersionReq::parse(range).map_err(|e| ValidationError::InvalidVersionRange {
                name: name.to_string(),
                range: range.to_string(),
                reason: e.to_string(),
            })?
        };
        VersionRange::from_req(&requirement).map_err(|reason| {
            ValidationError::InvalidVersionRange {
                name: name.to_string(),
                range: range.to_string(),
                reason,
            }
        })?;

        let strategy = match dep.strategy.as_deref() {
            None => SharingStrategy::Auto,
            Some(s) => SharingStrategy::parse(s).ok_or_else(|| ValidationError::UnknownStrategy {
                name: name.to_string(),
                strategy: s.to_string(),
            })?,
        };

        if strategy == SharingStrategy::Isolated && policy.is_process_singleton(name) {
            return Err(ValidationError::IsolatedSingleton(name.to_string()));
        }

        dependencies.push(DependencySpec {
            name: name.to_string(),
            requirement,
            strategy,
        });
    }

    let mut capabilities = BTreeSet::new();
    for (position, capability) in raw.capabilities.iter().enumerate() {
        let capability = capability.trim();
        if capability.is_empty() {
            return Err(ValidationError::EmptyCapability(position));
        }
        capabilities.insert(capability.to_string());
    }

    Ok(Manifest {
        id: id.to_string(),
        version,
        entry: entry.to_string(),
        framework: raw.framework.clone(),
        dependencies,
        capabilities,
    })
}

fn require_field<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(trimmed)
    }
}

/// JSON Schema describing the manifest wire format.
///
/// Build tooling emits manifests against this schema; the validator above is
/// the authority on semantic rules the schema cannot express (semver syntax,
/// duplicate names, singleton isolation).
pub fn manifest_schema() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Module manifest",
        "type": "object",
        "required": ["id", "version", "entry"],
        "properties": {
            "id": { "type": "string", "minLength": 1, "pattern": "^[^@]" },
            "version": { "type": "string", "description": "Semantic version" },
            "entry": { "type": "string", "minLength": 1 },
            "framework": {
                "type": "object",
                "properties": {
                    "kind": { "type": "string" },
                    "version": { "type": "string" }
                }
            },
            "dependencies": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": { "type": "string", "minLength": 1 },
                        "versionRange": { "type": "string" },
                        "strategy": { "enum": ["shared", "isolated", "auto"] }
                    }
                }
            },
            "capabilities": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "uniqueItems": true
            }
        }
    })
}
