//! Complete-file download with resume and bounded retry.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::context::InstallContext;
use crate::error::{ErrorCode, FragmenterError, FragmenterResult};
use super::stream::StreamDownloader;
use super::transport::HttpTransport;

/// Attempt ceiling for one file. Distinct from the orchestrator's
/// per-module retry loop, which re-runs whole module transfers.
pub const FILE_RETRY_CEILING: u32 = 5;

/// Drives a file to completion over one or more streaming attempts.
///
/// The URL is probed once for size and range support. With ranges, every
/// retry resumes from the bytes accumulated so far; without, each retry
/// restarts from zero and discards prior buffers. Attempts are separated
/// by an exponential backoff of `2^retry` seconds.
pub struct FileDownloader<'a> {
    transport: &'a dyn HttpTransport,
    ctx: &'a InstallContext,
}

impl<'a> FileDownloader<'a> {
    pub fn new(transport: &'a dyn HttpTransport, ctx: &'a InstallContext) -> Self {
        Self { transport, ctx }
    }

    /// Download `url` into `dest_path`, reporting cumulative progress.
    ///
    /// `module` labels the transfer in events. `size_hint` substitutes for
    /// a missing `content-length`. Returns the number of bytes written.
    pub async fn download(
        &self,
        url: &str,
        dest_path: &Path,
        module: &str,
        size_hint: Option<u64>,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> FragmenterResult<u64> {
        let probe = self.transport.probe(url).await?;
        self.ctx.ensure_active()?;
        let expected = probe.content_length.or(size_hint);

        let streamer = StreamDownloader::new(self.transport, self.ctx);
        let mut buffers: Vec<Bytes> = Vec::new();
        let mut accumulated: u64 = 0;
        let mut retry: u32 = 0;

        loop {
            self.ctx.ensure_active()?;

            if !probe.accepts_ranges {
                buffers.clear();
                accumulated = 0;
            }
            let base = accumulated;
            let outcome = streamer
                .download(url, base, &mut |attempt_bytes| {
                    on_progress(base + attempt_bytes, expected)
                })
                .await;

            accumulated += outcome.bytes_written;
            buffers.extend(outcome.buffers);

            match outcome.error {
                None => match expected {
                    // The body ended early without a transport error;
                    // treat it like an interrupted transfer and resume.
                    Some(total) if accumulated < total => {}
                    _ => break,
                },
                Some(err) => {
                    if err.code == ErrorCode::UserAborted || err.code.is_unrecoverable() {
                        return Err(err);
                    }
                    self.ctx.sink().error(&err);
                    debug!(url, %err, "download attempt failed");
                }
            }

            retry += 1;
            if retry >= FILE_RETRY_CEILING {
                return Err(FragmenterError::max_module_retries(module));
            }
            self.ctx.sink().download_interrupted(module, false);
            self.ctx.sleep(Duration::from_secs(2u64.pow(retry))).await?;
        }

        self.write_buffers(dest_path, &buffers).await?;
        Ok(accumulated)
    }

    async fn write_buffers(&self, dest_path: &Path, buffers: &[Bytes]) -> FragmenterResult<()> {
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FragmenterError::from_io(&e, parent))?;
        }
        let mut file = tokio::fs::File::create(dest_path)
            .await
            .map_err(|e| FragmenterError::from_io(&e, dest_path))?;
        for buffer in buffers {
            file.write_all(buffer)
                .await
                .map_err(|e| FragmenterError::from_io(&e, dest_path))?;
        }
        file.flush()
            .await
            .map_err(|e| FragmenterError::from_io(&e, dest_path))?;
        Ok(())
    }
}
