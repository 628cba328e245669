//! Single-attempt body streaming.

use bytes::Bytes;
use futures::StreamExt;

use crate::context::InstallContext;
use crate::error::FragmenterError;

use super::transport::HttpTransport;

/// What one streaming attempt produced.
///
/// Buffers received before a mid-stream failure are retained so the caller
/// can resume from the accumulated offset instead of starting over.
pub struct StreamOutcome {
    pub buffers: Vec<Bytes>,
    pub bytes_written: u64,
    pub error: Option<FragmenterError>,
}

/// Issues one ranged GET and drains the body.
///
/// No retry happens at this layer; the file downloader owns the resume
/// loop. Cancellation races every chunk await and surfaces as
/// `UserAborted`.
pub struct StreamDownloader<'a> {
    transport: &'a dyn HttpTransport,
    ctx: &'a InstallContext,
}

impl<'a> StreamDownloader<'a> {
    pub fn new(transport: &'a dyn HttpTransport, ctx: &'a InstallContext) -> Self {
        Self { transport, ctx }
    }

    /// Stream `url` from `start_offset` to the end of the body.
    ///
    /// `on_progress` receives the attempt's byte count after each buffer.
    pub async fn download(
        &self,
        url: &str,
        start_offset: u64,
        on_progress: &mut dyn FnMut(u64),
    ) -> StreamOutcome {
        let mut outcome = StreamOutcome {
            buffers: Vec::new(),
            bytes_written: 0,
            error: None,
        };

        if let Err(e) = self.ctx.ensure_active() {
            outcome.error = Some(e);
            return outcome;
        }

        let mut stream = tokio::select! {
            _ = self.ctx.cancel_token().cancelled() => {
                outcome.error = Some(FragmenterError::user_aborted());
                return outcome;
            }
            result = self.transport.get(url, start_offset) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    outcome.error = Some(e);
                    return outcome;
                }
            },
        };

        loop {
            let chunk = tokio::select! {
                _ = self.ctx.cancel_token().cancelled() => {
                    outcome.error = Some(FragmenterError::user_aborted());
                    return outcome;
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                None => break,
                Some(Ok(buffer)) => {
                    outcome.bytes_written += buffer.len() as u64;
                    outcome.buffers.push(buffer);
                    on_progress(outcome.bytes_written);
                }
                Some(Err(e)) => {
                    outcome.error = Some(e);
                    return outcome;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::transport::{ByteStream, ProbeInfo};
    use crate::error::{ErrorCode, FragmenterResult};
    use crate::events::NullSink;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct FixedTransport {
        chunks: Vec<FragmenterResult<Bytes>>,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn probe(&self, _url: &str) -> FragmenterResult<ProbeInfo> {
            Ok(ProbeInfo::default())
        }

        async fn get(&self, _url: &str, _start_offset: u64) -> FragmenterResult<ByteStream> {
            let chunks: Vec<_> = self
                .chunks
                .iter()
                .map(|c| match c {
                    Ok(b) => Ok(b.clone()),
                    Err(e) => Err(e.clone()),
                })
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn ctx() -> InstallContext {
        InstallContext::new(CancellationToken::new(), Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_clean_stream_collects_all_buffers() {
        let transport = FixedTransport {
            chunks: vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))],
        };
        let ctx = ctx();
        let mut seen = Vec::new();

        let outcome = StreamDownloader::new(&transport, &ctx)
            .download("http://x/f", 0, &mut |n| seen.push(n))
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.bytes_written, 5);
        assert_eq!(outcome.buffers.len(), 2);
        assert_eq!(seen, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_mid_stream_error_keeps_received_buffers() {
        let transport = FixedTransport {
            chunks: vec![
                Ok(Bytes::from_static(b"abc")),
                Err(FragmenterError::new(
                    ErrorCode::DownloadStreamClosed,
                    "reset",
                )),
            ],
        };
        let ctx = ctx();

        let outcome = StreamDownloader::new(&transport, &ctx)
            .download("http://x/f", 0, &mut |_| {})
            .await;

        assert_eq!(
            outcome.error.as_ref().unwrap().code,
            ErrorCode::DownloadStreamClosed
        );
        assert_eq!(outcome.bytes_written, 3);
        assert_eq!(outcome.buffers.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let transport = FixedTransport {
            chunks: vec![Ok(Bytes::from_static(b"abc"))],
        };
        let token = CancellationToken::new();
        let ctx = InstallContext::new(token.clone(), Arc::new(NullSink));
        token.cancel();

        let outcome = StreamDownloader::new(&transport, &ctx)
            .download("http://x/f", 0, &mut |_| {})
            .await;

        assert_eq!(outcome.error.unwrap().code, ErrorCode::UserAborted);
        assert_eq!(outcome.bytes_written, 0);
    }
}
