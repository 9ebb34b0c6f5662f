//! Crash recovery from the init-system unit directories.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use super::{AllocationError, Header, Pod, SystemPaths};

/// One path that failed to load during a recovery scan.
#[derive(Debug, Error)]
#[error("{}: {error}", path.display())]
pub struct RecoveryFailure {
    pub path: PathBuf,
    #[source]
    pub error: AllocationError,
}

/// Combined error for a recovery scan: every path that failed to load,
/// with its cause. Never fatal to the scan itself.
#[derive(Debug)]
pub struct RecoveryError {
    pub failures: Vec<RecoveryFailure>,
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} allocation(s) failed to recover: ", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RecoveryError {}

/// Allocations recovered at process start.
///
/// The only source of truth after a restart: there is no state database
/// besides the unit files themselves.
#[derive(Debug, Default)]
pub struct Recovery {
    pub pods: Vec<Pod>,
    pub failures: Vec<RecoveryFailure>,
}

impl Recovery {
    /// Load every candidate wrapper unit returned by `discover`.
    ///
    /// A failure on one path is collected and never aborts the scan.
    pub fn scan<F>(paths: &SystemPaths, discover: F) -> Self
    where
        F: FnOnce() -> Result<Vec<PathBuf>, AllocationError>,
    {
        let mut recovery = Self::default();
        let candidates = match discover() {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(error = %error, "pod discovery failed");
                let path = match &error {
                    AllocationError::Io { path, .. } => path.clone(),
                    _ => PathBuf::new(),
                };
                recovery.failures.push(RecoveryFailure { path, error });
                return recovery;
            }
        };
        for path in candidates {
            match Pod::from_filesystem(&path, paths) {
                Ok(pod) => {
                    debug!(pod = %pod.header.name, path = %path.display(), "recovered allocation");
                    recovery.pods.push(pod);
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to recover allocation");
                    recovery.failures.push(RecoveryFailure { path, error });
                }
            }
        }
        recovery
    }

    /// Header of the named allocation, if recovered.
    pub fn find(&self, name: &str) -> Option<&Header> {
        self.pods
            .iter()
            .find(|pod| pod.header.name == name)
            .map(|pod| &pod.header)
    }

    /// Fold collected failures into one combined error value, leaving the
    /// recovered pods untouched.
    pub fn take_error(&mut self) -> Option<RecoveryError> {
        if self.failures.is_empty() {
            return None;
        }
        Some(RecoveryError {
            failures: std::mem::take(&mut self.failures),
        })
    }
}

/// Default discovery: `pod-*.service` files in both unit directories.
/// Missing directories yield no candidates.
pub fn discover_pod_files(paths: &SystemPaths) -> Result<Vec<PathBuf>, AllocationError> {
    let mut res = Vec::new();
    for dir in [&paths.local, &paths.runtime] {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(AllocationError::Io {
                    path: dir.clone(),
                    source,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| AllocationError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("pod-") && name.ends_with(".service") {
                res.push(entry.path());
            }
        }
    }
    res.sort();
    Ok(res)
}
