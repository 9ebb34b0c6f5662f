//! Unit files, blobs and resource claims as allocated on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use loam_manifest::Transition;

use super::AllocationError;

/// Init-system unit file directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemPaths {
    /// Persistent units, survive reboot.
    pub local: PathBuf,

    /// Runtime units, cleared on boot.
    pub runtime: PathBuf,
}

impl SystemPaths {
    pub fn path_for(&self, name: &str, runtime: bool) -> PathBuf {
        if runtime {
            self.runtime.join(name)
        } else {
            self.local.join(name)
        }
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            local: PathBuf::from("/etc/systemd/system"),
            runtime: PathBuf::from("/run/systemd/system"),
        }
    }
}

/// A unit file on disk: path, rendered source and which unit directory
/// owns it. Written by the executor, read back during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFile {
    pub path: PathBuf,
    pub source: String,
    pub runtime: bool,
}

impl UnitFile {
    pub fn new(name: &str, paths: &SystemPaths, runtime: bool) -> Self {
        Self {
            path: paths.path_for(name, runtime),
            source: String::new(),
            runtime,
        }
    }

    /// Unit name as known to the init system.
    pub fn unit_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn read(&mut self) -> Result<(), AllocationError> {
        self.source = fs::read_to_string(&self.path).map_err(|source| AllocationError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn write(&self) -> Result<(), AllocationError> {
        let map_err = |source| AllocationError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(map_err)?;
        }
        fs::write(&self.path, &self.source).map_err(map_err)
    }

    pub fn remove(&self) -> Result<(), AllocationError> {
        fs::remove_file(&self.path).map_err(|source| AllocationError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// An allocated unit: a unit file plus its lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub unit_file: UnitFile,
    pub transition: Transition,
}

/// A static file owned by exactly one pod. `name` is the absolute target
/// path on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub name: String,
    pub permissions: u32,

    /// Preserve the file when the owning pod is destroyed.
    pub leave: bool,

    pub source: String,
}

impl Blob {
    pub fn read(&mut self) -> Result<(), AllocationError> {
        self.source = fs::read_to_string(&self.name).map_err(|source| AllocationError::Io {
            path: PathBuf::from(&self.name),
            source,
        })?;
        Ok(())
    }

    pub fn write(&self) -> Result<(), AllocationError> {
        let path = PathBuf::from(&self.name);
        let map_err = |source| AllocationError::Io {
            path: PathBuf::from(&self.name),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(map_err)?;
        }
        fs::write(&path, &self.source).map_err(map_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(self.permissions))
                .map_err(map_err)?;
        }
        Ok(())
    }

    pub fn remove(&self) -> Result<(), AllocationError> {
        fs::remove_file(&self.name).map_err(|source| AllocationError::Io {
            path: PathBuf::from(&self.name),
            source,
        })
    }
}

/// An allocated resource claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    pub required: bool,
    pub config: BTreeMap<String, serde_json::Value>,
}
