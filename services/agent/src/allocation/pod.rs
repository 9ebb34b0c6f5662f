//! Pod allocations: rendering from manifests and loading from disk.

use std::collections::BTreeMap;
use std::path::Path;

use loam_manifest::{interpolate, mark, Transition};

use super::{AllocationError, Blob, Header, Resource, SystemPaths, Unit, UnitFile};

const POD_UNIT_TEMPLATE: &str = "\
[Unit]
Description=${pod.name}
Before=${pod.units}
[Service]
${system.pod_exec}
[Install]
WantedBy=${pod.target}
";

/// A pod allocated on this agent: header plus wrapper unit file plus the
/// owned units, blobs and resource claims.
///
/// Pods are only ever replaced wholesale; there are no partial in-place
/// edits.
#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub header: Header,
    pub unit_file: UnitFile,
    pub units: Vec<Unit>,
    pub blobs: Vec<Blob>,
    pub resources: Vec<Resource>,
}

impl Pod {
    /// Render a pod from its manifest under the given environment.
    ///
    /// Blob content hashes are exposed to unit sources as
    /// `${blob.<mangled-path>}` so a changed blob restarts the units that
    /// reference it.
    pub fn from_manifest(
        manifest: &loam_manifest::Pod,
        env: &BTreeMap<String, String>,
        paths: &SystemPaths,
    ) -> Result<Self, AllocationError> {
        let header = Header {
            name: manifest.name.clone(),
            pod_mark: manifest.mark(),
            agent_mark: mark::of_map(env),
            namespace: manifest.namespace.clone(),
        };
        let mut unit_file = UnitFile::new(
            &format!("pod-{}-{}.service", manifest.namespace, manifest.name),
            paths,
            manifest.runtime,
        );

        let base_env = BTreeMap::from([
            ("pod.name".to_string(), manifest.name.clone()),
            ("pod.namespace".to_string(), manifest.namespace.clone()),
        ]);
        let source_env = BTreeMap::from([("pod.target".to_string(), manifest.target.clone())]);

        let mut blobs = Vec::new();
        let mut blob_hashes = BTreeMap::new();
        for blob in &manifest.blobs {
            let rendered = Blob {
                name: interpolate(&blob.name, &[&base_env]),
                permissions: blob.permissions,
                leave: blob.leave,
                source: interpolate(&blob.source, &[&base_env, &source_env, env]),
            };
            let key = format!(
                "blob.{}",
                rendered.name.trim_matches('/').replace('/', "-")
            );
            blob_hashes.insert(key, mark::of_str(&rendered.source).to_string());
            blobs.push(rendered);
        }

        let mut units = Vec::new();
        let mut unit_names = Vec::new();
        for unit in &manifest.units {
            let name = interpolate(&unit.name, &[&base_env]);
            let mut rendered = UnitFile::new(&name, paths, manifest.runtime);
            rendered.source = interpolate(&unit.source, &[&base_env, &source_env, &blob_hashes, env]);
            units.push(Unit {
                unit_file: rendered,
                transition: unit.transition.clone(),
            });
            unit_names.push(name);
        }

        let resources: Vec<Resource> = manifest
            .resources
            .iter()
            .map(|resource| Resource {
                kind: resource.kind.clone(),
                name: resource.name.clone(),
                required: resource.required,
                config: resource.config.clone(),
            })
            .collect();

        let mut source = header.marshal(&units, &blobs, &resources)?;
        let units_env = BTreeMap::from([("pod.units".to_string(), unit_names.join(" "))]);
        source.push_str(&interpolate(
            POD_UNIT_TEMPLATE,
            &[&base_env, &source_env, &units_env, env],
        ));
        unit_file.source = source;

        Ok(Self {
            header,
            unit_file,
            units,
            blobs,
            resources,
        })
    }

    /// Reconstruct a pod from its wrapper unit on disk, reading every
    /// owned unit and blob back from the filesystem.
    pub fn from_filesystem(path: &Path, paths: &SystemPaths) -> Result<Self, AllocationError> {
        let mut unit_file = UnitFile {
            path: path.to_path_buf(),
            source: String::new(),
            runtime: path.starts_with(&paths.runtime),
        };
        unit_file.read()?;
        let (header, mut units, mut blobs, resources) = Header::unmarshal(&unit_file.source)?;
        for unit in &mut units {
            unit.unit_file.read()?;
        }
        for blob in &mut blobs {
            blob.read()?;
        }
        Ok(Self {
            header,
            unit_file,
            units,
            blobs,
            resources,
        })
    }

    /// The wrapper unit itself, carrying the fixed pod lifecycle
    /// transition.
    pub fn pod_unit(&self) -> Unit {
        Unit {
            unit_file: self.unit_file.clone(),
            transition: Transition {
                create: "start".to_string(),
                update: "restart".to_string(),
                destroy: "stop".to_string(),
                permanent: true,
            },
        }
    }
}
