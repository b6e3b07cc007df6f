//! repro-core: reproducibility verification for Flathub applications
//!
//! Installs the published build of an app, rebuilds it from the same
//! manifest and sources, compares the two trees and reports one of
//! reproducible, unreproducible or failed.
//!
//! ## Layer 2 - Pipeline
//!
//! Focus: environment guard, resolve, rebuild, compare, publish, report.

pub mod comparator;
pub mod config;
pub mod digest;
pub mod domain;
pub mod fakes;
pub mod fs_util;
pub mod guard;
pub mod pipeline;
pub mod publisher;
pub mod quarantine;
pub mod rebuilder;
pub mod reporter;
pub mod resolver;
pub mod telemetry;

pub use domain::{
    ApplicationId, CheckTarget, ComparisonResult, DiffReport, FailureCause, ReproError, Result,
    ResultRecord, Stage, StatusCode,
};

pub use comparator::{Artifact, Comparator};
pub use config::{CheckerConfig, CiContext};
pub use digest::{tree_digest, TreeDigest};
pub use guard::{check_tools, cleanup, is_root, CleanupOutcome, WorkingRoot};
pub use pipeline::{CheckReport, CheckRequest, Checker};
pub use publisher::{ObjectStore, PublishError, Publisher, S3Config, S3Store};
pub use quarantine::Quarantine;
pub use rebuilder::{BuildOutput, MaskGuard, Rebuilder};
pub use reporter::{build_record, human_summary, resolve_log_url, OutputMode, Reporter};
pub use resolver::{precheck, BuildMetadata, ReferenceResolver};
pub use telemetry::{default_level, init_tracing};

/// Crate version, reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
