//! Install orchestration.
//!
//! [`Installer`] sequences one install run: plan, back up the existing
//! tree, transfer and extract each fragment, move staged files into
//! place, and persist the new install manifest. Any unrecovered failure
//! after backup restores the previous tree before the error propagates;
//! the staging directory is removed on every exit path.

pub mod backup;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::InstallContext;
use crate::download::{HttpTransport, ModuleDownloadRequest, ModuleDownloader};
use crate::error::{ErrorCode, FragmenterError, FragmenterResult};
use crate::events::{EventSink, InstallPhase, NullSink};
use crate::extract::ModuleDecompressor;
use crate::manifest::{
    DistributionManifest, DistributionModuleFile, InstallManifest, MODULE_JSON_FILE,
};
use crate::options::InstallOptions;
use crate::planner::{PlannedModule, UpdatePlan, UpdatePlanner};

use backup::Overwrite;

/// What an install run produced.
#[derive(Debug, Clone)]
pub struct InstallResult {
    /// False when the destination already matched the distribution and
    /// nothing was touched.
    pub changed: bool,
    pub manifest: InstallManifest,
}

/// Sequences a complete install or update of one destination directory.
///
/// The installer owns the destination exclusively for the duration of a
/// run. Fragments are processed strictly sequentially on the calling
/// task; events arrive in order through the registered sink.
pub struct Installer {
    transport: Arc<dyn HttpTransport>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    options: InstallOptions,
}

impl Installer {
    pub fn new(transport: Arc<dyn HttpTransport>, options: InstallOptions) -> Self {
        Self {
            transport,
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// Register the event observer for this installer.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Supply the cancellation token that aborts runs cooperatively.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &InstallOptions {
        &self.options
    }

    fn context(&self) -> InstallContext {
        InstallContext::new(self.cancel.clone(), Arc::clone(&self.sink))
    }

    /// Plan against the current destination without mutating anything.
    pub async fn needs_update(
        &self,
        base_url: &str,
        dest_dir: &Path,
    ) -> FragmenterResult<UpdatePlan> {
        let ctx = self.context();
        UpdatePlanner::new(self.transport.as_ref(), &ctx)
            .plan(base_url, dest_dir, &self.options)
            .await
    }

    /// Converge `dest_dir` on the state distributed at `base_url`.
    pub async fn install(&self, base_url: &str, dest_dir: &Path) -> FragmenterResult<InstallResult> {
        let ctx = self.context();
        let result = self.run(&ctx, base_url, dest_dir).await;

        match result {
            Ok(result) => {
                ctx.sink().phase_change(&InstallPhase::Done);
                Ok(result)
            }
            Err(err) => {
                if err.code == ErrorCode::UserAborted {
                    ctx.sink().cancelled();
                }
                ctx.sink().error(&err);
                ctx.sink().phase_change(&InstallPhase::Done);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        ctx: &InstallContext,
        base_url: &str,
        dest_dir: &Path,
    ) -> FragmenterResult<InstallResult> {
        ctx.sink().phase_change(&InstallPhase::UpdateCheck);
        let plan = UpdatePlanner::new(self.transport.as_ref(), ctx)
            .plan(base_url, dest_dir, &self.options)
            .await?;

        if !plan.needs_update {
            let manifest = plan.existing.ok_or_else(|| {
                FragmenterError::new(ErrorCode::Unknown, "no-op plan without an install manifest")
            })?;
            info!("destination already up to date");
            return Ok(InstallResult {
                changed: false,
                manifest,
            });
        }

        let full_install = plan.is_fresh_install
            || self.options.force_fresh_install
            || plan.will_fully_re_download
            || plan.existing_fully_replaced();
        info!(full_install, "starting install");

        ctx.sink().phase_change(&InstallPhase::InstallBegin);
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| FragmenterError::from_io(&e, dest_dir))?;
        let temp_root = self.prepare_temp_dir().await?;

        let run = InstallRun {
            installer: self,
            ctx,
            base_url,
            dest_dir,
            restore_dir: temp_root.join("restore"),
            extract_root: temp_root.join("extract"),
            plan: &plan,
        };
        let outcome = run.execute(full_install).await;

        // The staging directory goes away on every exit path.
        if let Err(e) = tokio::fs::remove_dir_all(&temp_root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_root.display(), error = %e, "failed to remove temp directory");
            }
        }

        let manifest = outcome?;
        Ok(InstallResult {
            changed: true,
            manifest,
        })
    }

    async fn prepare_temp_dir(&self) -> FragmenterResult<PathBuf> {
        match &self.options.temporary_directory {
            Some(path) => {
                if path.exists()
                    && std::fs::read_dir(path)
                        .map_err(|e| FragmenterError::from_io(&e, path))?
                        .next()
                        .is_some()
                {
                    return Err(FragmenterError::new(
                        ErrorCode::InvalidOptions,
                        format!(
                            "temporary directory {} is not empty; it must be unique per run",
                            path.display()
                        ),
                    ));
                }
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| FragmenterError::from_io(&e, path))?;
                Ok(path.clone())
            }
            None => tempfile::Builder::new()
                .prefix("fragmenter-")
                .tempdir()
                .map(tempfile::TempDir::keep)
                .map_err(|e| FragmenterError::from_io(&e, &std::env::temp_dir())),
        }
    }
}

/// State of one install run after planning: the plan, the destination,
/// and the staging layout under the run's temp directory.
struct InstallRun<'a> {
    installer: &'a Installer,
    ctx: &'a InstallContext,
    base_url: &'a str,
    dest_dir: &'a Path,
    restore_dir: PathBuf,
    extract_root: PathBuf,
    plan: &'a UpdatePlan,
}

impl InstallRun<'_> {
    fn options(&self) -> &InstallOptions {
        &self.installer.options
    }

    fn sink(&self) -> &dyn EventSink {
        self.ctx.sink()
    }

    /// Back up the destination, apply the plan, and restore on failure.
    async fn execute(&self, full_install: bool) -> FragmenterResult<InstallManifest> {
        self.sink().backup_started();
        backup::move_tree(self.dest_dir, &self.restore_dir, Overwrite::Skip).await?;
        self.sink().backup_finished();

        let mut applied = if full_install {
            self.apply_full().await
        } else {
            self.apply_modular().await
        };

        // A modular update defeated by retries falls back to the full
        // fragment, with the backup still in place as the safety net.
        if let Err(err) = &applied {
            if err.code == ErrorCode::MaxModuleRetries
                && !full_install
                && !self.options().disable_fallback_to_full
            {
                warn!(%err, "modular update failed, falling back to full install");
                applied = self.apply_full().await;
            }
        }

        let finished = match applied {
            Ok(()) => self.finish().await,
            Err(err) => Err(err),
        };

        match finished {
            Ok(manifest) => Ok(manifest),
            Err(err) => {
                self.sink().phase_change(&InstallPhase::InstallFailRestore);
                if self.restore_dir.exists() {
                    if let Err(restore_err) = restore(self.dest_dir, &self.restore_dir).await {
                        // Surface the restore failure without masking the
                        // original error code.
                        warn!(%restore_err, "restore after failed install did not complete");
                        self.sink().error(&restore_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Replace the whole destination with the full fragment.
    async fn apply_full(&self) -> FragmenterResult<()> {
        self.ctx.ensure_active()?;
        backup::empty_dir(self.dest_dir).await?;

        let full = PlannedModule {
            name: "full".to_string(),
            dest_dir: String::new(),
            alternative_key: None,
            file: full_download_file(&self.plan.distribution),
        };
        let staging = self.extract_root.join(&full.name);
        self.fragment_with_retries(&full, 0, &staging).await?;
        // The root-level hash document stays behind; module directories
        // keep their own embedded module.json.
        backup::remove_if_exists(&staging.join(MODULE_JSON_FILE)).await?;
        backup::move_tree_with_events(
            self.sink(),
            &full.name,
            &staging,
            self.dest_dir,
            Overwrite::Replace,
        )
        .await?;
        Ok(())
    }

    /// Apply a modular update: base handling, removals, per-module
    /// transfers, and restoration of unchanged modules from backup.
    async fn apply_modular(&self) -> FragmenterResult<()> {
        let distribution = &self.plan.distribution;

        if self.plan.base_changed {
            // Only the files the old manifest lists may be deleted.
            if let Some(existing) = &self.plan.existing {
                backup::remove_listed_files(&existing.base.files, self.dest_dir).await?;
            }

            let base = PlannedModule {
                name: "base".to_string(),
                dest_dir: String::new(),
                alternative_key: None,
                file: base_download_file(distribution),
            };
            let staging = self.extract_root.join(&base.name);
            self.fragment_with_retries(&base, 0, &staging).await?;
            backup::move_listed_files(
                &distribution.base.files,
                &staging,
                self.dest_dir,
                Overwrite::Replace,
            )
            .await?;
        } else if let Some(existing) = &self.plan.existing {
            // Copied, not moved: the backup stays complete so a later
            // failure can still restore the pre-install tree bit for bit.
            backup::copy_listed_files(&existing.base.files, &self.restore_dir, self.dest_dir)
                .await?;
        }

        self.ctx.ensure_active()?;
        for module in self.plan.removed.iter().chain(
            self.plan
                .existing
                .iter()
                .flat_map(|e| e.modules.iter())
                .filter(|m| self.plan.updated.iter().any(|u| u.name == m.name)),
        ) {
            backup::remove_if_exists(&self.dest_dir.join(&module.dest_dir)).await?;
        }

        for (index, module) in self.plan.pending_modules().into_iter().enumerate() {
            let staging = self.extract_root.join(&module.name);
            self.fragment_with_retries(module, index, &staging).await?;
            backup::move_tree_with_events(
                self.sink(),
                &module.name,
                &staging,
                &self.dest_dir.join(&module.dest_dir),
                Overwrite::Replace,
            )
            .await?;
        }

        for module in &self.plan.unchanged {
            self.ctx.ensure_active()?;
            backup::copy_tree(
                &self.restore_dir.join(&module.dest_dir),
                &self.dest_dir.join(&module.dest_dir),
            )
            .await?;
        }

        Ok(())
    }

    /// The per-module retry loop around one transfer + decompress attempt.
    async fn fragment_with_retries(
        &self,
        module: &PlannedModule,
        index: usize,
        staging: &Path,
    ) -> FragmenterResult<()> {
        let mut retry: u32 = 0;
        loop {
            self.ctx.ensure_active()?;
            let attempt = self.transfer_fragment(module, index, retry, staging).await;

            match attempt {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.sink().error(&err);
                    if err.code == ErrorCode::UserAborted || err.code.is_unrecoverable() {
                        return Err(err);
                    }
                    retry += 1;
                    if retry >= self.options().max_module_retries {
                        return Err(FragmenterError::max_module_retries(&module.name));
                    }
                    let wait = 2u64.pow(retry);
                    warn!(module = %module.name, retry, wait, "retrying module install");
                    self.sink().retry_scheduled(&module.name, retry, wait);
                    self.ctx.sleep(Duration::from_secs(wait)).await?;
                    self.sink().retry_started(&module.name, retry);
                }
            }
        }
    }

    /// One attempt: download the fragment ZIP and extract it into staging.
    async fn transfer_fragment(
        &self,
        module: &PlannedModule,
        index: usize,
        retry: u32,
        staging: &Path,
    ) -> FragmenterResult<()> {
        self.sink().phase_change(&InstallPhase::ModuleDownload {
            module: module.name.clone(),
            module_index: index,
        });
        tokio::fs::create_dir_all(&self.extract_root)
            .await
            .map_err(|e| FragmenterError::from_io(&e, &self.extract_root))?;

        let request = ModuleDownloadRequest {
            base_url: self.base_url,
            module_name: &module.name,
            alternative_key: module.alternative_key.as_deref(),
            file: &module.file,
            full_hash: &self.plan.distribution.full_hash,
            dest_dir: self.extract_root.parent().unwrap_or(&self.extract_root),
            retry_count: retry,
            force_cache_bust: self.options().force_cache_bust,
        };
        let zip_path = ModuleDownloader::new(self.installer.transport.as_ref(), self.ctx)
            .download(&request)
            .await?;

        self.sink().phase_change(&InstallPhase::ModuleDecompress {
            module: module.name.clone(),
            module_index: index,
        });
        // A previous failed attempt may have left partial staging behind.
        backup::remove_if_exists(staging).await?;
        let extracted = ModuleDecompressor::new(self.ctx)
            .extract_and_verify(&module.name, &zip_path, staging, &module.file.hash)
            .await;
        backup::remove_if_exists(&zip_path).await?;
        extracted
    }

    /// Persist the new install manifest; the last step before `Done`.
    async fn finish(&self) -> FragmenterResult<InstallManifest> {
        self.sink().phase_change(&InstallPhase::InstallFinish);
        let manifest = InstallManifest::from_distribution(
            self.base_url,
            &self.plan.distribution,
            self.plan
                .resolved_modules
                .iter()
                .map(|m| m.as_installed())
                .collect(),
        );
        manifest.write_to(self.dest_dir).await?;
        info!("install finished");
        Ok(manifest)
    }
}

/// Put the backed-up tree back, bit for bit.
async fn restore(dest_dir: &Path, restore_dir: &Path) -> FragmenterResult<()> {
    backup::empty_dir(dest_dir).await?;
    backup::move_tree(restore_dir, dest_dir, Overwrite::Skip).await?;
    Ok(())
}

/// The base fragment described as a downloadable file.
fn base_download_file(distribution: &DistributionManifest) -> DistributionModuleFile {
    DistributionModuleFile {
        key: "base".to_string(),
        path: String::new(),
        hash: distribution.base.hash.clone(),
        compression: "zip".to_string(),
        split_file_count: distribution.base.split_file_count,
        complete_file_size: distribution.base.complete_file_size,
        complete_file_size_uncompressed: distribution.base.complete_file_size_uncompressed,
    }
}

/// The full fragment described as a downloadable file.
fn full_download_file(distribution: &DistributionManifest) -> DistributionModuleFile {
    DistributionModuleFile {
        key: "full".to_string(),
        path: String::new(),
        hash: distribution.full_hash.clone(),
        compression: "zip".to_string(),
        split_file_count: distribution.full_split_file_count,
        complete_file_size: distribution.full_complete_file_size,
        complete_file_size_uncompressed: distribution.full_complete_file_size_uncompressed,
    }
}
