//! Content-addressed allocation model.
//!
//! A [`Pod`] is the unit of deployment: a wrapper unit file whose leading
//! header lines embed a self-describing record of every unit, blob and
//! resource claim the pod owns. The embedded header is the only
//! persistence layer: after a restart the agent reconstructs its state
//! from these files alone.

mod header;
mod pod;
mod recovery;
mod unit;

pub use header::Header;
pub use pod::Pod;
pub use recovery::{discover_pod_files, Recovery, RecoveryError, RecoveryFailure};
pub use unit::{Blob, Resource, SystemPaths, Unit, UnitFile};

use std::path::PathBuf;

use thiserror::Error;

/// Errors loading or storing a single allocation.
///
/// Fatal to the one pod or file involved; callers scanning many files
/// collect these instead of aborting.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed header line {line:?}")]
    Header { line: String },

    #[error("bad JSON in header line {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}
