//! Whole-module fragment download.
//!
//! Selects the fragment file for a module, fetches it either as one file
//! or as N ordered split parts, and leaves a single `<name>.zip` in the
//! destination directory.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::context::InstallContext;
use crate::error::FragmenterError;
use crate::events::DownloadProgress;
use crate::manifest::DistributionModuleFile;

use super::file::FileDownloader;
use super::transport::HttpTransport;

/// Suffix of a split part on the server: `<file>.sf-part<NN>`.
const SPLIT_PART_SUFFIX: &str = ".sf-part";
/// Suffix of a part being staged locally: `<name>.zip.fg-tmp<NN>`.
const PART_TMP_SUFFIX: &str = ".fg-tmp";

/// One module transfer, fully described.
pub struct ModuleDownloadRequest<'a> {
    pub base_url: &'a str,
    pub module_name: &'a str,
    /// Chosen alternative key, for modules of kind alternatives.
    pub alternative_key: Option<&'a str>,
    pub file: &'a DistributionModuleFile,
    /// Hash of the distribution's full fragment, used for cache keying.
    pub full_hash: &'a str,
    /// Directory the assembled `<name>.zip` lands in.
    pub dest_dir: &'a Path,
    /// Module-level retry this transfer belongs to; advertised to the CDN.
    pub retry_count: u32,
    pub force_cache_bust: bool,
}

/// Fetches one fragment, whole or split, into a local ZIP.
pub struct ModuleDownloader<'a> {
    transport: &'a dyn HttpTransport,
    ctx: &'a InstallContext,
}

impl<'a> ModuleDownloader<'a> {
    pub fn new(transport: &'a dyn HttpTransport, ctx: &'a InstallContext) -> Self {
        Self { transport, ctx }
    }

    /// Download the fragment described by `req`.
    ///
    /// Returns the path of the assembled `<name>.zip`.
    pub async fn download(&self, req: &ModuleDownloadRequest<'_>) -> Result<PathBuf, FragmenterError> {
        self.ctx.ensure_active()?;
        self.ctx.sink().download_started(req.module_name);

        let zip_path = req.dest_dir.join(format!("{}.zip", req.module_name));
        if req.file.split_file_count > 1 {
            self.download_split(req, &zip_path).await?;
        } else {
            self.download_single(req, &zip_path).await?;
        }

        self.ctx.sink().download_finished(req.module_name);
        Ok(zip_path)
    }

    async fn download_single(
        &self,
        req: &ModuleDownloadRequest<'_>,
        zip_path: &Path,
    ) -> Result<(), FragmenterError> {
        let url = decorate_url(req, &relative_path(req));
        let sink = self.ctx.sink();
        let module = req.module_name;

        FileDownloader::new(self.transport, self.ctx)
            .download(
                &url,
                zip_path,
                module,
                Some(req.file.complete_file_size),
                &mut |loaded, total| {
                    sink.download_progress(module, &DownloadProgress::new(loaded, total));
                },
            )
            .await?;
        Ok(())
    }

    async fn download_split(
        &self,
        req: &ModuleDownloadRequest<'_>,
        zip_path: &Path,
    ) -> Result<(), FragmenterError> {
        let num_parts = req.file.split_file_count;
        let total = req.file.complete_file_size;
        let rel = relative_path(req);
        let downloader = FileDownloader::new(self.transport, self.ctx);

        let mut part_paths = Vec::with_capacity(num_parts as usize);
        let mut bytes_before: u64 = 0;

        for index in 1..=num_parts {
            self.ctx.ensure_active()?;
            let suffix = part_suffix(index, num_parts);
            let part_url = decorate_url(req, &format!("{rel}{SPLIT_PART_SUFFIX}{suffix}"));
            let part_path = req
                .dest_dir
                .join(format!("{}.zip{PART_TMP_SUFFIX}{suffix}", req.module_name));
            debug!(module = req.module_name, part = index, num_parts, "fetching split part");

            let sink = self.ctx.sink();
            let module = req.module_name;
            let written = downloader
                .download(&part_url, &part_path, module, None, &mut |loaded, _| {
                    sink.download_progress(
                        module,
                        &DownloadProgress::new(bytes_before + loaded, Some(total))
                            .with_part(index, num_parts),
                    );
                })
                .await?;

            bytes_before += written;
            part_paths.push(part_path);
        }

        self.merge_parts(&part_paths, zip_path).await
    }

    /// Append each part to the target ZIP in index order, deleting parts
    /// as they are consumed. A failure here is not retried at this level.
    async fn merge_parts(&self, parts: &[PathBuf], zip_path: &Path) -> Result<(), FragmenterError> {
        let mut target = tokio::fs::File::create(zip_path)
            .await
            .map_err(|e| FragmenterError::from_io(&e, zip_path))?;

        for part in parts {
            self.ctx.ensure_active()?;
            let mut source = tokio::fs::File::open(part)
                .await
                .map_err(|e| FragmenterError::from_io(&e, part))?;
            tokio::io::copy(&mut source, &mut target)
                .await
                .map_err(|e| FragmenterError::from_io(&e, zip_path))?;
            tokio::fs::remove_file(part)
                .await
                .map_err(|e| FragmenterError::from_io(&e, part))?;
        }
        Ok(())
    }
}

/// Relative URL of a fragment under the distribution base.
///
/// An explicit `path` on the download file wins; otherwise the
/// conventional `<name>.zip` / `<name>/<key>.zip` location applies.
fn relative_path(req: &ModuleDownloadRequest<'_>) -> String {
    if !req.file.path.is_empty() {
        return req.file.path.clone();
    }
    match req.alternative_key {
        Some(key) => format!("{}/{key}.zip", req.module_name),
        None => format!("{}.zip", req.module_name),
    }
}

/// Compose the request URL with its informational cache parameters.
fn decorate_url(req: &ModuleDownloadRequest<'_>, relative: &str) -> String {
    let mut url = format!(
        "{}/{relative}?moduleHash={}&fullHash={}",
        req.base_url.trim_end_matches('/'),
        hash_prefix(&req.file.hash),
        hash_prefix(req.full_hash),
    );
    if req.retry_count > 0 {
        url.push_str(&format!("&retry={}", req.retry_count));
    }
    if req.force_cache_bust {
        url.push_str(&format!("&cache={}", cache_token()));
    }
    url
}

fn hash_prefix(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

/// Opaque per-request token; never parsed by anyone.
pub(crate) fn cache_token() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// 1-based part index, zero-padded to the decimal width of the part count
/// (at least two digits).
fn part_suffix(index: u32, count: u32) -> String {
    let width = count.to_string().len().max(2);
    format!("{index:0width$}")
}
