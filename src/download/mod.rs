//! Fragment transfer pipeline.
//!
//! Three layers, outermost first: [`module::ModuleDownloader`] selects and
//! assembles one fragment (whole or split into parts),
//! [`file::FileDownloader`] drives a complete file transfer with resume and
//! bounded retry, and [`stream::StreamDownloader`] performs a single ranged
//! GET attempt. The HTTP client sits behind [`transport::HttpTransport`].

pub mod file;
pub mod module;
pub mod stream;
pub mod transport;

pub use file::FileDownloader;
pub use module::{ModuleDownloadRequest, ModuleDownloader};
pub use stream::{StreamDownloader, StreamOutcome};
pub use transport::{ByteStream, HttpTransport, ProbeInfo, ReqwestTransport};
