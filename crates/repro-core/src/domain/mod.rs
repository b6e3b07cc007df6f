//! Domain models for the reproducibility checker.
//!
//! - `ApplicationId` / `CheckTarget`: what is being checked
//! - `ComparisonResult`: the single terminal outcome of a run
//! - `ResultRecord`: the machine-readable report
//! - `ReproError`: fatal, record-impossible errors

pub mod app_id;
pub mod error;
pub mod outcome;
pub mod record;

pub use app_id::{ApplicationId, CheckTarget};
pub use error::{ReproError, Result};
pub use outcome::{ComparisonResult, DiffReport, FailureCause, Stage, StatusCode};
pub use record::ResultRecord;
