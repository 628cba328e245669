//! Manifest data model.
//!
//! Two documents describe package state: the server-side
//! [`DistributionManifest`] (`modules.json`) and the client-side
//! [`InstallManifest`] (`install.json`). Both serialise with camelCase
//! field names; hashes are lowercase hex strings.
//!
//! A module is a sum type: [`DistributionModule::Simple`] carries one
//! download file, [`DistributionModule::Alternatives`] carries one download
//! file per selectable key, of which exactly one is installed at a time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, FragmenterError, FragmenterResult};

/// File name of the distribution manifest on the server.
pub const DISTRIBUTION_MANIFEST_FILE: &str = "modules.json";
/// File name of the install manifest inside the destination directory.
pub const INSTALL_MANIFEST_FILE: &str = "install.json";
/// File name of the per-fragment hash document at a fragment's root.
pub const MODULE_JSON_FILE: &str = "module.json";

/// Module names that cannot be used by distributed modules.
pub const RESERVED_MODULE_NAMES: [&str; 2] = ["base", "full"];

/// The base fragment: every file not carved out into a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Base {
    pub hash: String,
    /// Relative paths of all base files at the install destination. These
    /// are the only files the engine may delete during a base update.
    pub files: Vec<String>,
    pub split_file_count: u32,
    pub complete_file_size: u64,
    pub complete_file_size_uncompressed: u64,
}

/// One downloadable fragment file of a distributed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionModuleFile {
    /// Alternative key, or the module name for simple modules.
    pub key: String,
    /// Relative URL under the distribution base. May be empty, in which
    /// case the conventional `<name>.zip` / `<name>/<key>.zip` location
    /// applies.
    #[serde(default)]
    pub path: String,
    pub hash: String,
    pub compression: String,
    pub split_file_count: u32,
    pub complete_file_size: u64,
    pub complete_file_size_uncompressed: u64,
}

/// A distributed module with a single fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleModule {
    pub name: String,
    pub dest_dir: String,
    pub download_file: DistributionModuleFile,
}

/// A distributed module with mutually exclusive variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlternativesModule {
    pub name: String,
    pub dest_dir: String,
    /// One download file per alternative key.
    pub download_files: Vec<DistributionModuleFile>,
}

/// A module as described by the distribution manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DistributionModule {
    #[serde(rename = "simple")]
    Simple(SimpleModule),
    #[serde(rename = "alternatives")]
    Alternatives(AlternativesModule),
}

impl DistributionModule {
    pub fn name(&self) -> &str {
        match self {
            Self::Simple(m) => &m.name,
            Self::Alternatives(m) => &m.name,
        }
    }

    pub fn dest_dir(&self) -> &str {
        match self {
            Self::Simple(m) => &m.dest_dir,
            Self::Alternatives(m) => &m.dest_dir,
        }
    }

    pub fn is_alternatives(&self) -> bool {
        matches!(self, Self::Alternatives(_))
    }

    /// Resolve the download file for this module.
    ///
    /// Simple modules ignore the key. Alternatives require a key matching
    /// one of their download files; anything else is `InvalidParameters`.
    pub fn download_file(
        &self,
        alternative_key: Option<&str>,
    ) -> FragmenterResult<&DistributionModuleFile> {
        match self {
            Self::Simple(m) => Ok(&m.download_file),
            Self::Alternatives(m) => {
                let key = alternative_key.ok_or_else(|| {
                    FragmenterError::new(
                        ErrorCode::InvalidParameters,
                        format!("module '{}' requires an alternative key", m.name),
                    )
                })?;
                m.download_files.iter().find(|f| f.key == key).ok_or_else(|| {
                    FragmenterError::new(
                        ErrorCode::InvalidParameters,
                        format!("module '{}' has no alternative '{key}'", m.name),
                    )
                })
            }
        }
    }
}

/// Server-side description of the distributable package state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub modules: Vec<DistributionModule>,
    pub base: Base,
    pub full_hash: String,
    pub full_split_file_count: u32,
    pub full_complete_file_size: u64,
    pub full_complete_file_size_uncompressed: u64,
}

impl DistributionManifest {
    /// Parse and validate a `modules.json` document.
    pub fn from_slice(bytes: &[u8]) -> FragmenterResult<Self> {
        let manifest: Self = serde_json::from_slice(bytes).map_err(|e| {
            FragmenterError::new(
                ErrorCode::InvalidDistributionManifest,
                format!("failed to parse {DISTRIBUTION_MANIFEST_FILE}: {e}"),
            )
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Enforce manifest invariants: unique case-sensitive module names, no
    /// reserved names, and no module destination nested inside another's.
    pub fn validate(&self) -> FragmenterResult<()> {
        let invalid = |detail: String| {
            FragmenterError::new(ErrorCode::InvalidDistributionManifest, detail)
        };

        for (i, module) in self.modules.iter().enumerate() {
            let name = module.name();
            if RESERVED_MODULE_NAMES.contains(&name) {
                return Err(invalid(format!("module name '{name}' is reserved")));
            }
            if self.modules[i + 1..].iter().any(|m| m.name() == name) {
                return Err(invalid(format!("duplicate module name '{name}'")));
            }
            for other in &self.modules[i + 1..] {
                if dirs_nested(module.dest_dir(), other.dest_dir()) {
                    return Err(invalid(format!(
                        "module directories '{}' and '{}' are nested",
                        module.dest_dir(),
                        other.dest_dir()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&DistributionModule> {
        self.modules.iter().find(|m| m.name() == name)
    }
}

/// One module entry of the install manifest: the distributed identity plus
/// the verified hash and, for alternatives, the installed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledModule {
    pub name: String,
    pub dest_dir: String,
    /// Hash of the fragment that was verified after extraction.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_alternative_key: Option<String>,
}

/// Client-side record of the currently installed package state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Base URL the package was installed from.
    pub source: String,
    pub modules: Vec<InstalledModule>,
    pub base: Base,
    pub full_hash: String,
    pub full_split_file_count: u32,
    pub full_complete_file_size: u64,
    pub full_complete_file_size_uncompressed: u64,
}

impl InstallManifest {
    /// Build the manifest recorded after a successful install.
    ///
    /// Populated in one step from the distribution and the per-module
    /// install records; nothing partial is ever serialised.
    pub fn from_distribution(
        source: &str,
        distribution: &DistributionManifest,
        modules: Vec<InstalledModule>,
    ) -> Self {
        Self {
            version: distribution.version.clone(),
            source: source.to_string(),
            modules,
            base: distribution.base.clone(),
            full_hash: distribution.full_hash.clone(),
            full_split_file_count: distribution.full_split_file_count,
            full_complete_file_size: distribution.full_complete_file_size,
            full_complete_file_size_uncompressed: distribution
                .full_complete_file_size_uncompressed,
        }
    }

    /// Read `install.json` from a destination directory.
    ///
    /// A missing file is `Ok(None)` (fresh install); an unreadable or
    /// unparsable file is an error.
    pub async fn load(dest_dir: &Path) -> FragmenterResult<Option<Self>> {
        let path = dest_dir.join(INSTALL_MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FragmenterError::from_io(&e, &path)),
        };
        let manifest = serde_json::from_slice(&bytes).map_err(|e| {
            FragmenterError::new(
                ErrorCode::InvalidDistributionManifest,
                format!("failed to parse {}: {e}", path.display()),
            )
        })?;
        Ok(Some(manifest))
    }

    /// Write `install.json` into a destination directory.
    ///
    /// The document is written to a sibling temp file first and renamed
    /// into place, so a crash never leaves a half-written manifest.
    pub async fn write_to(&self, dest_dir: &Path) -> FragmenterResult<()> {
        let path = dest_dir.join(INSTALL_MANIFEST_FILE);
        let staging = dest_dir.join(format!("{INSTALL_MANIFEST_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            FragmenterError::new(ErrorCode::Unknown, format!("manifest serialisation: {e}"))
        })?;
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &staging))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &path))?;
        Ok(())
    }

    pub fn module(&self, name: &str) -> Option<&InstalledModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// The hash document embedded at a fragment's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleJson {
    pub hash: String,
}

/// True when one relative directory is equal to or contained in the other.
fn dirs_nested(a: &str, b: &str) -> bool {
    let a = PathBuf::from(a);
    let b = PathBuf::from(b);
    a.starts_with(&b) || b.starts_with(&a)
}
