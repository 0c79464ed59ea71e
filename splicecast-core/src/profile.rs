use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConfigError, Result};

/// Named output configuration handed to the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeProfile {
    pub name: String,
    pub output_args: Vec<String>,
    pub description: Option<String>,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    name: Option<String>,
    #[serde(default)]
    output_args: Option<Value>,
    description: Option<String>,
    listen_port: Option<u16>,
}

/// Immutable lookup table of profiles, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, TranscodeProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: impl IntoIterator<Item = TranscodeProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    /// Loads every `*.json` file in `dir`. A missing directory yields an empty registry.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Self::default());
        }
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
            source,
            path: dir.to_path_buf(),
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Io {
                source,
                path: dir.to_path_buf(),
            })?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut profiles = BTreeMap::new();
        for path in paths {
            let profile = load_profile(&path)?;
            debug!(profile = %profile.name, path = %path.display(), "profile loaded");
            profiles.insert(profile.name.clone(), profile);
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Option<&TranscodeProfile> {
        self.profiles.get(name)
    }

    pub fn resolve(&self, name: &str) -> Result<&TranscodeProfile> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// Profiles sorted by name.
    pub fn list(&self) -> Vec<TranscodeProfile> {
        self.profiles.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn load_profile(path: &Path) -> Result<TranscodeProfile> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let raw: ProfileFile = serde_json::from_str(&content).map_err(|source| ConfigError::Profile {
        source,
        path: path.to_path_buf(),
    })?;
    let name = raw
        .name
        .filter(|name| !name.trim().is_empty())
        .or_else(|| file_stem(path))
        .ok_or_else(|| invalid(path, "profile has no name"))?;
    let output_args = match raw.output_args {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values.into_iter().map(stringify).collect(),
        Some(_) => return Err(invalid(path, "output_args must be a list")),
    };
    Ok(TranscodeProfile {
        name,
        output_args,
        description: raw.description,
        listen_port: raw.listen_port,
    })
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
}

fn invalid(path: &Path, reason: &str) -> ConfigError {
    ConfigError::InvalidProfile {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_fixture_profiles() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../profiles");
        let registry = ProfileRegistry::load_dir(dir).unwrap();
        let low = registry.resolve("aga_low").unwrap();
        assert_eq!(low.listen_port, Some(5001));
        assert!(low.output_args.contains(&"25".to_string()));
        // name falls back to the file stem
        let mid = registry.resolve("aga_mid").unwrap();
        assert_eq!(mid.listen_port, None);
        let names: Vec<_> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["aga_low", "aga_mid"]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let registry = ProfileRegistry::load_dir(dir.path().join("nope")).unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("aga_low"),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn rejects_non_list_output_args() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"name": "bad", "output_args": "-c:v copy"}"#,
        )
        .unwrap();
        let err = ProfileRegistry::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProfile { .. }));
    }

    #[test]
    fn ignores_other_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a profile").unwrap();
        std::fs::write(
            dir.path().join("copy.json"),
            r#"{"output_args": ["-c", "copy"], "description": "passthrough"}"#,
        )
        .unwrap();
        let registry = ProfileRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("copy").unwrap().description.as_deref(),
            Some("passthrough")
        );
    }
}
