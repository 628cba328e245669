//! Fragment extraction and verification.
//!
//! A fragment ZIP is extracted entry by entry into a staging directory,
//! then the embedded `module.json` hash document is compared against the
//! hash the distribution manifest advertised.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::InstallContext;
use crate::error::{ErrorCode, FragmenterError, FragmenterResult};
use crate::events::EventSink;
use crate::manifest::{ModuleJson, MODULE_JSON_FILE};

/// Extracts fragment ZIPs and checks their embedded hash.
pub struct ModuleDecompressor<'a> {
    ctx: &'a InstallContext,
}

impl<'a> ModuleDecompressor<'a> {
    pub fn new(ctx: &'a InstallContext) -> Self {
        Self { ctx }
    }

    /// Extract `zip_path` into `dest_dir` and verify the fragment hash.
    ///
    /// Emits `unzipStarted` / `unzipProgress` per entry / `unzipFinished`.
    /// A missing or malformed `module.json` is `ModuleJsonInvalid`; a hash
    /// that does not match `expected_hash` is `ModuleCrcMismatch`. Both are
    /// recoverable: the caller re-downloads the fragment.
    pub async fn extract_and_verify(
        &self,
        module: &str,
        zip_path: &Path,
        dest_dir: &Path,
        expected_hash: &str,
    ) -> FragmenterResult<()> {
        self.ctx.ensure_active()?;
        self.ctx.sink().unzip_started(module);

        let entry_count = {
            let module = module.to_string();
            let zip_path = zip_path.to_path_buf();
            let dest_dir = dest_dir.to_path_buf();
            let sink = self.ctx.shared_sink();
            let cancel = self.ctx.cancel_token().clone();
            tokio::task::spawn_blocking(move || {
                extract_archive(&module, &zip_path, &dest_dir, sink.as_ref(), &cancel)
            })
            .await
            .map_err(|e| FragmenterError::new(ErrorCode::Unknown, format!("extraction task: {e}")))??
        };
        self.ctx.ensure_active()?;

        self.verify_module_json(dest_dir, expected_hash).await?;
        debug!(module, entry_count, "fragment extracted and verified");
        self.ctx.sink().unzip_finished(module);
        Ok(())
    }

    async fn verify_module_json(&self, dest_dir: &Path, expected_hash: &str) -> FragmenterResult<()> {
        let path = dest_dir.join(MODULE_JSON_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            FragmenterError::new(
                ErrorCode::ModuleJsonInvalid,
                format!("{}: {e}", path.display()),
            )
        })?;
        let document: ModuleJson = serde_json::from_slice(&bytes).map_err(|e| {
            FragmenterError::new(
                ErrorCode::ModuleJsonInvalid,
                format!("{}: {e}", path.display()),
            )
        })?;

        if document.hash != expected_hash {
            return Err(FragmenterError::new(
                ErrorCode::ModuleCrcMismatch,
                format!(
                    "fragment hash mismatch: expected {expected_hash}, found {}",
                    document.hash
                ),
            ));
        }
        Ok(())
    }
}

/// Blocking extraction loop. Cancellation is re-checked between entries.
fn extract_archive(
    module: &str,
    zip_path: &Path,
    dest_dir: &Path,
    sink: &dyn EventSink,
    cancel: &CancellationToken,
) -> FragmenterResult<usize> {
    let file = fs::File::open(zip_path).map_err(|e| FragmenterError::from_io(&e, zip_path))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| FragmenterError::from_zip(e, zip_path))?;

    fs::create_dir_all(dest_dir).map_err(|e| FragmenterError::from_io(&e, dest_dir))?;

    let entry_count = archive.len();
    for index in 0..entry_count {
        if cancel.is_cancelled() {
            return Err(FragmenterError::user_aborted());
        }

        let mut entry = archive
            .by_index(index)
            .map_err(|e| FragmenterError::from_zip(e, zip_path))?;
        let entry_name = entry.name().to_string();
        let target = entry_target(dest_dir, &entry, zip_path)?;

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| FragmenterError::from_io(&e, &target))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| FragmenterError::from_io(&e, parent))?;
            }
            let mut out =
                fs::File::create(&target).map_err(|e| FragmenterError::from_io(&e, &target))?;
            io::copy(&mut entry, &mut out).map_err(|e| classify_copy_error(e, &target))?;
        }

        sink.unzip_progress(module, index, &entry_name, entry_count);
    }

    Ok(entry_count)
}

/// Resolve an entry's on-disk target, rejecting paths that escape the
/// staging directory.
fn entry_target(
    dest_dir: &Path,
    entry: &zip::read::ZipFile<'_>,
    zip_path: &Path,
) -> FragmenterResult<PathBuf> {
    let enclosed = entry.enclosed_name().ok_or_else(|| {
        FragmenterError::new(
            ErrorCode::CorruptedZipFile,
            format!(
                "{}: entry '{}' escapes the extraction directory",
                zip_path.display(),
                entry.name()
            ),
        )
    })?;
    Ok(dest_dir.join(enclosed))
}

/// A truncated deflate stream surfaces as UnexpectedEof while copying.
fn classify_copy_error(err: io::Error, target: &Path) -> FragmenterError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FragmenterError::new(
            ErrorCode::CorruptedZipFile,
            format!("{}: unexpected EOF in compressed stream", target.display()),
        )
    } else {
        FragmenterError::from_io(&err, target)
    }
}
