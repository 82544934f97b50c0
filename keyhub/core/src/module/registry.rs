//! Module Registry
//!
//! Installed modules live one per directory, each with a `manifest.json`:
//!
//! ```text
//!   <modules dir>/
//!   ├── echo/
//!   │   ├── manifest.json   {"id": "echo", "name": .., "version": .., "runtime": {..}}
//!   │   └── bin/echo
//!   └── obs/
//!       └── manifest.json
//! ```
//!
//! The system directory is scanned first, then the user directory; a user
//! module replaces a system module with the same id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ModulesConfig;
use crate::rpc::ENV_MODULE_PATH;
use crate::supervisor::ProcessSpec;

/// Manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifest loading errors
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid manifest document
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// A required field is empty
    #[error("invalid manifest {path}: {reason}")]
    Invalid {
        /// Manifest path
        path: PathBuf,
        /// What is wrong
        reason: String,
    },
}

/// How to launch a module
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRuntime {
    /// Executable or script, relative to the install path unless absolute
    pub entrypoint: String,
    /// Interpreter that runs the entrypoint (for example `node`)
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Extra arguments after the entrypoint
    #[serde(default)]
    pub args: Vec<String>,
    /// Module API version the module was built against
    #[serde(default)]
    pub api_version: Option<String>,
}

/// Parsed `manifest.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    /// Module id, referenced by connections
    pub id: String,
    /// Display name
    pub name: String,
    /// Module version
    pub version: String,
    /// Launch description
    pub runtime: ModuleRuntime,
    /// Declared capabilities, only shape-checked
    #[serde(default)]
    pub capabilities: Value,
}

impl ModuleManifest {
    fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        let missing = [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("runtime.entrypoint", &self.runtime.entrypoint),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        if let Some((field, _)) = missing {
            return Err(ManifestError::Invalid {
                path: path.to_path_buf(),
                reason: format!("{field} is empty"),
            });
        }
        if !(self.capabilities.is_null() || self.capabilities.is_object()) {
            return Err(ManifestError::Invalid {
                path: path.to_path_buf(),
                reason: "capabilities must be an object".to_string(),
            });
        }
        Ok(())
    }
}

/// Where a module was found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provenance {
    /// Bundled with the hub
    System,
    /// Installed by the user
    User,
}

/// A registered module
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleInfo {
    /// Parsed manifest
    pub manifest: ModuleManifest,
    /// Directory the manifest was found in
    pub install_path: PathBuf,
    /// System or user install
    pub provenance: Provenance,
}

impl ModuleInfo {
    /// Load the manifest in `install_path`
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is missing, unparsable or has empty
    /// required fields.
    pub fn load(install_path: &Path, provenance: Provenance) -> Result<Self, ManifestError> {
        let path = install_path.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest: ModuleManifest =
            serde_json::from_str(&raw).map_err(|source| ManifestError::Parse {
                path: path.clone(),
                source,
            })?;
        manifest.validate(&path)?;
        Ok(Self {
            manifest,
            install_path: install_path.to_path_buf(),
            provenance,
        })
    }

    /// Module id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Launch spec for this module (connection env is added by the host)
    #[must_use]
    pub fn launch_spec(&self) -> ProcessSpec {
        let runtime = &self.manifest.runtime;
        let entrypoint = {
            let path = Path::new(&runtime.entrypoint);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.install_path.join(path)
            }
        };

        let mut spec = match &runtime.interpreter {
            Some(interpreter) => {
                ProcessSpec::new(interpreter).arg(entrypoint.to_string_lossy().into_owned())
            }
            None => ProcessSpec::new(entrypoint),
        };
        for arg in &runtime.args {
            spec = spec.arg(arg.clone());
        }
        spec.cwd(&self.install_path).env(
            ENV_MODULE_PATH,
            self.install_path.to_string_lossy().into_owned(),
        )
    }
}

/// Known modules by id
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    system_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    modules: RwLock<HashMap<String, ModuleInfo>>,
}

impl ModuleRegistry {
    /// Registry over the configured directories; call [`rescan`](Self::rescan) to populate
    #[must_use]
    pub fn new(config: &ModulesConfig) -> Self {
        Self {
            system_dir: config.system_dir.clone(),
            user_dir: config.user_dir.clone(),
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the registered set with what is on disk; returns the module count
    ///
    /// Modules added with [`register`](Self::register) are dropped unless
    /// they are also on disk.
    pub fn rescan(&self) -> usize {
        let mut found = HashMap::new();
        for (dir, provenance) in [
            (&self.system_dir, Provenance::System),
            (&self.user_dir, Provenance::User),
        ] {
            if let Some(dir) = dir {
                for info in scan_dir(dir, provenance) {
                    if let Some(previous) = found.insert(info.id().to_string(), info) {
                        tracing::info!(
                            module = %previous.manifest.id,
                            path = %previous.install_path.display(),
                            "Module overridden by later install"
                        );
                    }
                }
            }
        }

        let count = found.len();
        *self.modules.write() = found;
        tracing::info!(count, "Module scan complete");
        count
    }

    /// Register a module directly, replacing any with the same id
    pub fn register(&self, info: ModuleInfo) {
        self.modules.write().insert(info.id().to_string(), info);
    }

    /// Look up a module
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ModuleInfo> {
        self.modules.read().get(id).cloned()
    }

    /// All module ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn scan_dir(dir: &Path, provenance: Provenance) -> Vec<ModuleInfo> {
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::debug!(path = %dir.display(), "Module directory not readable");
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.join(MANIFEST_FILE).is_file())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match ModuleInfo::load(&path, provenance) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping module");
                None
            }
        })
        .collect()
}
