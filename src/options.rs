//! Installer configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ErrorCode, FragmenterError, FragmenterResult};

/// Default cap on the per-module retry loop.
pub const DEFAULT_MAX_MODULE_RETRIES: u32 = 5;

/// Configuration for one install run.
///
/// All fields carry working defaults; construct with [`InstallOptions::default`]
/// and adjust through the `with_*` setters.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Staging directory for this run. Must be unique per run; a random
    /// directory under the OS temp dir is created when unset.
    pub temporary_directory: Option<PathBuf>,
    /// Cap on the per-module retry loop.
    pub max_module_retries: u32,
    /// Skip the planner's modular decision and always full-install.
    pub force_fresh_install: bool,
    /// Append a random cache parameter to every request URL.
    pub force_cache_bust: bool,
    /// Append a random cache parameter to the manifest URL only.
    pub force_manifest_cache_bust: bool,
    /// Propagate `MaxModuleRetries` instead of retrying with the full
    /// fragment.
    pub disable_fallback_to_full: bool,
    /// Chosen alternative key per module name. Required for every module
    /// of kind alternatives.
    pub module_alternatives: HashMap<String, String>,
    /// When `|added ∪ updated| / |existing|` exceeds this ratio, upgrade
    /// the plan to a full re-download. Must lie in `(0, 1]`.
    pub force_full_install_ratio: Option<f64>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            temporary_directory: None,
            max_module_retries: DEFAULT_MAX_MODULE_RETRIES,
            force_fresh_install: false,
            force_cache_bust: false,
            force_manifest_cache_bust: false,
            disable_fallback_to_full: false,
            module_alternatives: HashMap::new(),
            force_full_install_ratio: None,
        }
    }
}

impl InstallOptions {
    pub fn with_temporary_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temporary_directory = Some(dir.into());
        self
    }

    pub fn with_max_module_retries(mut self, retries: u32) -> Self {
        self.max_module_retries = retries;
        self
    }

    pub fn with_force_fresh_install(mut self, force: bool) -> Self {
        self.force_fresh_install = force;
        self
    }

    pub fn with_force_cache_bust(mut self, force: bool) -> Self {
        self.force_cache_bust = force;
        self
    }

    pub fn with_force_manifest_cache_bust(mut self, force: bool) -> Self {
        self.force_manifest_cache_bust = force;
        self
    }

    pub fn with_disable_fallback_to_full(mut self, disable: bool) -> Self {
        self.disable_fallback_to_full = disable;
        self
    }

    pub fn with_alternative(mut self, module: impl Into<String>, key: impl Into<String>) -> Self {
        self.module_alternatives.insert(module.into(), key.into());
        self
    }

    pub fn with_force_full_install_ratio(mut self, ratio: f64) -> Self {
        self.force_full_install_ratio = Some(ratio);
        self
    }

    /// The chosen alternative key for a module, if one was supplied.
    pub fn alternative_for(&self, module: &str) -> Option<&str> {
        self.module_alternatives.get(module).map(String::as_str)
    }

    /// Reject configurations that cannot produce a valid plan.
    pub fn validate(&self) -> FragmenterResult<()> {
        if let Some(ratio) = self.force_full_install_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(FragmenterError::new(
                    ErrorCode::InvalidOptions,
                    format!("forceFullInstallRatio must lie in (0, 1], got {ratio}"),
                ));
            }
        }
        if self.max_module_retries == 0 {
            return Err(FragmenterError::new(
                ErrorCode::InvalidOptions,
                "maxModuleRetries must be at least 1",
            ));
        }
        Ok(())
    }
}
