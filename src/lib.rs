//! Fragmenter - content-addressed package distribution for large
//! directory trees.
//!
//! A package is split at build time into a **base** fragment, a **full**
//! fragment, and named **modules** (optionally with mutually exclusive
//! **alternatives**). Each fragment is a ZIP, optionally split into parts,
//! carrying a verification hash. At install time the engine diffs the
//! server's distribution manifest against the local install manifest and
//! applies the minimum set of downloads and on-disk mutations to converge,
//! with crash-safe backup/restore and bounded retry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fragmenter::{InstallOptions, Installer, ReqwestTransport};
//!
//! # async fn example() -> Result<(), fragmenter::FragmenterError> {
//! let installer = Installer::new(
//!     Arc::new(ReqwestTransport::new()),
//!     InstallOptions::default().with_alternative("liveries", "alt-a"),
//! );
//! let result = installer
//!     .install("https://cdn.example.com/my-addon", "/sim/addons/my-addon".as_ref())
//!     .await?;
//! println!("changed: {}", result.changed);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod download;
pub mod error;
pub mod events;
pub mod extract;
pub mod hashing;
pub mod install;
pub mod manifest;
pub mod options;
pub mod planner;

pub use context::InstallContext;
pub use download::{FileDownloader, HttpTransport, ModuleDownloader, ProbeInfo, ReqwestTransport};
pub use error::{ErrorCode, FragmenterError, FragmenterResult};
pub use events::{DownloadProgress, EventSink, InstallPhase, NullSink};
pub use extract::ModuleDecompressor;
pub use install::{InstallResult, Installer};
pub use manifest::{
    Base, DistributionManifest, DistributionModule, DistributionModuleFile, InstallManifest,
    InstalledModule, ModuleJson,
};
pub use options::InstallOptions;
pub use planner::{compute_plan, PlannedModule, UpdatePlan, UpdatePlanner};
