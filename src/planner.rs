//! Update planning.
//!
//! The planner fetches the distribution manifest, reads the local install
//! manifest (when one exists), and produces the minimal work list that
//! converges the destination on the distributed state. The diff is
//! semantic: manifest ordering never affects the plan, and planning the
//! same inputs twice yields equal plans.

use std::path::Path;

use tracing::info;

use crate::context::InstallContext;
use crate::download::module::cache_token;
use crate::download::{HttpTransport, StreamDownloader};
use crate::error::{ErrorCode, FragmenterError, FragmenterResult};
use crate::manifest::{
    DistributionManifest, DistributionModuleFile, InstallManifest, InstalledModule,
    DISTRIBUTION_MANIFEST_FILE,
};
use crate::options::InstallOptions;

/// A module with its download file and alternative key resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedModule {
    pub name: String,
    pub dest_dir: String,
    /// The chosen key, for modules of kind alternatives.
    pub alternative_key: Option<String>,
    pub file: DistributionModuleFile,
}

impl PlannedModule {
    /// The install-manifest entry this module produces once installed.
    pub fn as_installed(&self) -> InstalledModule {
        InstalledModule {
            name: self.name.clone(),
            dest_dir: self.dest_dir.clone(),
            hash: self.file.hash.clone(),
            installed_alternative_key: self.alternative_key.clone(),
        }
    }
}

/// The work list produced by planning.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub needs_update: bool,
    pub is_fresh_install: bool,
    pub base_changed: bool,
    /// True when the ratio of changed modules pushed the plan up to a
    /// whole-package re-download.
    pub will_fully_re_download: bool,
    pub added: Vec<PlannedModule>,
    pub removed: Vec<InstalledModule>,
    pub updated: Vec<PlannedModule>,
    pub unchanged: Vec<InstalledModule>,
    /// Compressed bytes to transfer, absent when nothing needs doing.
    pub download_size: Option<u64>,
    /// Uncompressed bytes the staged fragments will occupy.
    pub required_disk_space: Option<u64>,
    pub distribution: DistributionManifest,
    pub existing: Option<InstallManifest>,
    /// Every distribution module with its resolved file and key, in
    /// distribution order. Drives install-manifest construction.
    pub resolved_modules: Vec<PlannedModule>,
}

impl UpdatePlan {
    /// Modules to transfer for a modular update, in distribution order.
    pub fn pending_modules(&self) -> Vec<&PlannedModule> {
        self.resolved_modules
            .iter()
            .filter(|m| {
                self.updated.iter().any(|u| u.name == m.name)
                    || self.added.iter().any(|a| a.name == m.name)
            })
            .collect()
    }

    /// True when no existing module survives unchanged, which makes a
    /// modular update pointless.
    pub fn existing_fully_replaced(&self) -> bool {
        self.unchanged.is_empty()
    }
}

/// Computes the difference between distributed and installed state.
pub struct UpdatePlanner<'a> {
    transport: &'a dyn HttpTransport,
    ctx: &'a InstallContext,
}

impl<'a> UpdatePlanner<'a> {
    pub fn new(transport: &'a dyn HttpTransport, ctx: &'a InstallContext) -> Self {
        Self { transport, ctx }
    }

    /// Fetch both manifests and produce the plan for `dest_dir`.
    pub async fn plan(
        &self,
        base_url: &str,
        dest_dir: &Path,
        options: &InstallOptions,
    ) -> FragmenterResult<UpdatePlan> {
        options.validate()?;
        let distribution = self.fetch_distribution(base_url, options).await?;
        self.ctx.ensure_active()?;
        let existing = InstallManifest::load(dest_dir).await?;

        let plan = compute_plan(distribution, existing, options)?;
        info!(
            needs_update = plan.needs_update,
            fresh = plan.is_fresh_install,
            added = plan.added.len(),
            removed = plan.removed.len(),
            updated = plan.updated.len(),
            unchanged = plan.unchanged.len(),
            "update plan computed"
        );
        Ok(plan)
    }

    /// Fetch and parse `modules.json` from the distribution base URL.
    pub async fn fetch_distribution(
        &self,
        base_url: &str,
        options: &InstallOptions,
    ) -> FragmenterResult<DistributionManifest> {
        let mut url = format!(
            "{}/{DISTRIBUTION_MANIFEST_FILE}",
            base_url.trim_end_matches('/')
        );
        if options.force_cache_bust || options.force_manifest_cache_bust {
            url.push_str(&format!("?cache={}", cache_token()));
        }

        let outcome = StreamDownloader::new(self.transport, self.ctx)
            .download(&url, 0, &mut |_| {})
            .await;
        if let Some(err) = outcome.error {
            return Err(err);
        }

        let mut bytes = Vec::with_capacity(outcome.bytes_written as usize);
        for buffer in &outcome.buffers {
            bytes.extend_from_slice(buffer);
        }
        DistributionManifest::from_slice(&bytes)
    }
}

/// Pure planning step over already-loaded manifests.
pub fn compute_plan(
    distribution: DistributionManifest,
    existing: Option<InstallManifest>,
    options: &InstallOptions,
) -> FragmenterResult<UpdatePlan> {
    let resolved_modules = resolve_modules(&distribution, options)?;

    let Some(existing) = existing else {
        return Ok(fresh_install_plan(distribution, resolved_modules));
    };

    let base_changed = existing.base.hash != distribution.base.hash;

    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut unchanged = Vec::new();
    for planned in &resolved_modules {
        match existing.module(&planned.name) {
            None => added.push(planned.clone()),
            Some(installed) => {
                let key_differs = planned.alternative_key.as_deref()
                    != installed.installed_alternative_key.as_deref();
                let hash_differs = planned.file.hash != installed.hash;
                if key_differs || hash_differs {
                    updated.push(planned.clone());
                } else {
                    unchanged.push(installed.clone());
                }
            }
        }
    }
    let removed: Vec<InstalledModule> = existing
        .modules
        .iter()
        .filter(|m| distribution.module(&m.name).is_none())
        .cloned()
        .collect();

    let needs_update =
        base_changed || !added.is_empty() || !removed.is_empty() || !updated.is_empty();

    let changed_count = added.len() + updated.len();
    let mut will_fully_re_download = false;
    if let Some(ratio) = options.force_full_install_ratio {
        let existing_count = existing.modules.len().max(1);
        if changed_count as f64 / existing_count as f64 > ratio {
            will_fully_re_download = true;
        }
    }

    let (download_size, required_disk_space) = if !needs_update {
        (None, None)
    } else if will_fully_re_download {
        (
            Some(distribution.full_complete_file_size),
            Some(distribution.full_complete_file_size_uncompressed),
        )
    } else {
        let changed = added.iter().chain(updated.iter());
        (
            Some(changed.clone().map(|m| m.file.complete_file_size).sum()),
            Some(
                changed
                    .map(|m| m.file.complete_file_size_uncompressed)
                    .sum(),
            ),
        )
    };

    Ok(UpdatePlan {
        needs_update,
        is_fresh_install: false,
        base_changed,
        will_fully_re_download,
        added,
        removed,
        updated,
        unchanged,
        download_size,
        required_disk_space,
        distribution,
        existing: Some(existing),
        resolved_modules,
    })
}

/// Resolve every module's download file up front, so an invalid or
/// missing alternative selection fails planning rather than mid-install.
fn resolve_modules(
    distribution: &DistributionManifest,
    options: &InstallOptions,
) -> FragmenterResult<Vec<PlannedModule>> {
    let mut resolved = Vec::with_capacity(distribution.modules.len());
    for module in &distribution.modules {
        let key = if module.is_alternatives() {
            let key = options.alternative_for(module.name()).ok_or_else(|| {
                FragmenterError::new(
                    ErrorCode::InvalidOptions,
                    format!("no alternative selected for module '{}'", module.name()),
                )
            })?;
            Some(key.to_string())
        } else {
            None
        };

        let file = module.download_file(key.as_deref()).map_err(|e| {
            FragmenterError::new(ErrorCode::InvalidOptions, e.detail)
        })?;

        resolved.push(PlannedModule {
            name: module.name().to_string(),
            dest_dir: module.dest_dir().to_string(),
            alternative_key: key,
            file: file.clone(),
        });
    }
    Ok(resolved)
}

fn fresh_install_plan(
    distribution: DistributionManifest,
    resolved_modules: Vec<PlannedModule>,
) -> UpdatePlan {
    UpdatePlan {
        needs_update: true,
        is_fresh_install: true,
        base_changed: true,
        will_fully_re_download: false,
        added: resolved_modules.clone(),
        removed: Vec::new(),
        updated: Vec::new(),
        unchanged: Vec::new(),
        download_size: Some(distribution.full_complete_file_size),
        required_disk_space: Some(distribution.full_complete_file_size_uncompressed),
        distribution,
        existing: None,
        resolved_modules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{AlternativesModule, Base, DistributionModule, SimpleModule};

    fn file(key: &str, hash: &str) -> DistributionModuleFile {
        DistributionModuleFile {
            key: key.to_string(),
            path: String::new(),
            hash: hash.to_string(),
            compression: "zip".to_string(),
            split_file_count: 1,
            complete_file_size: 100,
            complete_file_size_uncompressed: 300,
        }
    }

    fn simple(name: &str, hash: &str) -> DistributionModule {
        DistributionModule::Simple(SimpleModule {
            name: name.to_string(),
            dest_dir: name.to_string(),
            download_file: file(name, hash),
        })
    }

    fn alternatives(name: &str, keys: &[(&str, &str)]) -> DistributionModule {
        DistributionModule::Alternatives(AlternativesModule {
            name: name.to_string(),
            dest_dir: name.to_string(),
            download_files: keys.iter().map(|(k, h)| file(k, h)).collect(),
        })
    }

    fn distribution(modules: Vec<DistributionModule>) -> DistributionManifest {
        DistributionManifest {
            version: None,
            modules,
            base: Base {
                hash: "base-1".to_string(),
                files: vec!["core.bin".to_string()],
                split_file_count: 1,
                complete_file_size: 50,
                complete_file_size_uncompressed: 80,
            },
            full_hash: "full-1".to_string(),
            full_split_file_count: 1,
            full_complete_file_size: 5000,
            full_complete_file_size_uncompressed: 9000,
        }
    }

    fn installed(name: &str, hash: &str, key: Option<&str>) -> InstalledModule {
        InstalledModule {
            name: name.to_string(),
            dest_dir: name.to_string(),
            hash: hash.to_string(),
            installed_alternative_key: key.map(str::to_string),
        }
    }

    fn install_manifest(modules: Vec<InstalledModule>) -> InstallManifest {
        InstallManifest {
            version: None,
            source: "http://cdn/pkg".to_string(),
            modules,
            base: Base {
                hash: "base-1".to_string(),
                files: vec!["core.bin".to_string()],
                split_file_count: 1,
                complete_file_size: 50,
                complete_file_size_uncompressed: 80,
            },
            full_hash: "full-0".to_string(),
            full_split_file_count: 1,
            full_complete_file_size: 4000,
            full_complete_file_size_uncompressed: 8000,
        }
    }

    #[test]
    fn test_fresh_install_adds_everything() {
        let dist = distribution(vec![simple("a", "a1"), simple("b", "b1")]);
        let plan = compute_plan(dist, None, &InstallOptions::default()).unwrap();

        assert!(plan.is_fresh_install);
        assert!(plan.base_changed);
        assert!(plan.needs_update);
        assert_eq!(plan.added.len(), 2);
        assert!(plan.removed.is_empty() && plan.updated.is_empty() && plan.unchanged.is_empty());
        // Fresh installs size against the full fragment.
        assert_eq!(plan.download_size, Some(5000));
        assert_eq!(plan.required_disk_space, Some(9000));
    }

    #[test]
    fn test_no_op_when_manifests_agree() {
        let dist = distribution(vec![simple("a", "a1")]);
        let existing = install_manifest(vec![installed("a", "a1", None)]);

        let plan = compute_plan(dist, Some(existing), &InstallOptions::default()).unwrap();

        assert!(!plan.needs_update);
        assert_eq!(plan.unchanged.len(), 1);
        assert_eq!(plan.download_size, None);
    }

    #[test]
    fn test_hash_change_classifies_updated() {
        let dist = distribution(vec![simple("a", "a1"), simple("b", "b2")]);
        let existing =
            install_manifest(vec![installed("a", "a1", None), installed("b", "b1", None)]);

        let plan = compute_plan(dist, Some(existing), &InstallOptions::default()).unwrap();

        assert!(plan.needs_update);
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(plan.updated[0].name, "b");
        assert_eq!(plan.unchanged.len(), 1);
        assert_eq!(plan.download_size, Some(100));
        assert_eq!(plan.required_disk_space, Some(300));
    }

    #[test]
    fn test_classification_partitions_module_names() {
        let dist = distribution(vec![simple("a", "a1"), simple("b", "b2"), simple("c", "c1")]);
        let existing =
            install_manifest(vec![installed("a", "a1", None), installed("b", "b1", None),
                installed("gone", "g1", None)]);

        let plan = compute_plan(dist, Some(existing), &InstallOptions::default()).unwrap();

        let mut names: Vec<&str> = plan
            .added
            .iter()
            .map(|m| m.name.as_str())
            .chain(plan.updated.iter().map(|m| m.name.as_str()))
            .chain(plan.unchanged.iter().map(|m| m.name.as_str()))
            .chain(plan.removed.iter().map(|m| m.name.as_str()))
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "b", "c", "gone"]);
    }

    #[test]
    fn test_missing_alternative_selection_is_invalid_options() {
        let dist = distribution(vec![alternatives("d", &[("alt-a", "a1"), ("alt-b", "b1")])]);

        let err = compute_plan(dist.clone(), None, &InstallOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOptions);

        let err = compute_plan(
            dist,
            None,
            &InstallOptions::default().with_alternative("d", "alt-c"),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOptions);
    }

    #[test]
    fn test_alternative_key_change_is_updated() {
        let dist = distribution(vec![alternatives("d", &[("alt-a", "a1"), ("alt-b", "b1")])]);
        let existing = install_manifest(vec![installed("d", "a1", Some("alt-a"))]);

        // Same key, same hash: unchanged.
        let plan = compute_plan(
            dist.clone(),
            Some(existing.clone()),
            &InstallOptions::default().with_alternative("d", "alt-a"),
        )
        .unwrap();
        assert!(!plan.needs_update);

        // Different key: updated, even though the module is the same.
        let plan = compute_plan(
            dist,
            Some(existing),
            &InstallOptions::default().with_alternative("d", "alt-b"),
        )
        .unwrap();
        assert_eq!(plan.updated.len(), 1);
        assert_eq!(plan.updated[0].alternative_key.as_deref(), Some("alt-b"));
    }

    #[test]
    fn test_plan_is_order_independent_and_idempotent() {
        let dist_ab = distribution(vec![simple("a", "a1"), simple("b", "b2")]);
        let dist_ba = distribution(vec![simple("b", "b2"), simple("a", "a1")]);
        let existing =
            install_manifest(vec![installed("b", "b1", None), installed("a", "a1", None)]);
        let options = InstallOptions::default();

        let plan_ab = compute_plan(dist_ab.clone(), Some(existing.clone()), &options).unwrap();
        let plan_ba = compute_plan(dist_ba, Some(existing.clone()), &options).unwrap();
        assert_eq!(plan_ab.updated, plan_ba.updated);
        assert_eq!(plan_ab.unchanged, plan_ba.unchanged);

        let again = compute_plan(dist_ab, Some(existing), &options).unwrap();
        assert_eq!(plan_ab, again);
    }

    #[test]
    fn test_ratio_upgrade_to_full_redownload() {
        let dist = distribution(vec![simple("a", "a2"), simple("b", "b2"), simple("c", "c2")]);
        let existing = install_manifest(vec![
            installed("a", "a1", None),
            installed("b", "b1", None),
            installed("c", "c1", None),
        ]);

        // 3/3 changed > 0.5: upgrade.
        let plan = compute_plan(
            dist.clone(),
            Some(existing.clone()),
            &InstallOptions::default().with_force_full_install_ratio(0.5),
        )
        .unwrap();
        assert!(plan.will_fully_re_download);
        assert_eq!(plan.download_size, Some(5000));

        // Ratio of exactly 1.0 is not exceeded by 3/3.
        let plan = compute_plan(
            dist,
            Some(existing),
            &InstallOptions::default().with_force_full_install_ratio(1.0),
        )
        .unwrap();
        assert!(!plan.will_fully_re_download);
    }

    #[test]
    fn test_pending_modules_follow_distribution_order() {
        let dist = distribution(vec![simple("c", "c2"), simple("a", "a2"), simple("b", "b1")]);
        let existing =
            install_manifest(vec![installed("a", "a1", None), installed("b", "b1", None)]);

        let plan = compute_plan(dist, Some(existing), &InstallOptions::default()).unwrap();
        let pending: Vec<&str> = plan.pending_modules().iter().map(|m| m.name.as_str()).collect();
        // c is added, a is updated; distribution lists c before a.
        assert_eq!(pending, vec!["c", "a"]);
    }

    #[test]
    fn test_base_change_alone_needs_update() {
        let mut dist = distribution(vec![simple("a", "a1")]);
        dist.base.hash = "base-2".to_string();
        let existing = install_manifest(vec![installed("a", "a1", None)]);

        let plan = compute_plan(dist, Some(existing), &InstallOptions::default()).unwrap();
        assert!(plan.base_changed);
        assert!(plan.needs_update);
        assert_eq!(plan.download_size, Some(0));
    }
}
