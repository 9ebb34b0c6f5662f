//! Self-describing pod header (de)serialization.
//!
//! The wrapper unit of every pod begins with `###` header lines, one
//! compact JSON record per owned object:
//!
//! ```text
//! ### POD <name> {"pod_mark":1,"agent_mark":2,"namespace":"private"}
//! ### UNIT <path> {"create":"start","update":"restart","destroy":"stop","permanent":false,"runtime":true}
//! ### BLOB <name> {"permissions":420,"leave":false}
//! ### RESOURCE <kind> <name> {"required":true,"config":{}}
//! ```
//!
//! The rendered init-system directives follow the header lines and are
//! ignored by the parser. Unit and blob sources are not embedded: recovery
//! reads them back from their own files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use loam_manifest::{mark, Transition};
use serde::{Deserialize, Serialize};

use super::{AllocationError, Blob, Resource, Unit, UnitFile};

const POD_PREFIX: &str = "### POD ";
const UNIT_PREFIX: &str = "### UNIT ";
const BLOB_PREFIX: &str = "### BLOB ";
const RESOURCE_PREFIX: &str = "### RESOURCE ";

/// Identity of an allocated pod.
///
/// Two pods with equal headers are treated as byte-for-byte equivalent;
/// any field difference forces a full re-render. The mark pair is the sole
/// authority for change detection, never individual unit or blob diffs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(skip)]
    pub name: String,

    /// Hash of the manifest's semantic content.
    pub pod_mark: u64,

    /// Hash of the environment the pod was rendered under.
    pub agent_mark: u64,

    pub namespace: String,
}

#[derive(Serialize, Deserialize)]
struct UnitRecord {
    create: String,
    update: String,
    destroy: String,
    permanent: bool,
    runtime: bool,
}

#[derive(Serialize, Deserialize)]
struct BlobRecord {
    permissions: u32,
    leave: bool,
}

#[derive(Serialize, Deserialize)]
struct ResourceRecord {
    required: bool,
    config: BTreeMap<String, serde_json::Value>,
}

impl Header {
    /// Mark over the full header, name included.
    pub fn mark(&self) -> u64 {
        mark::digest(&serde_json::json!({
            "name": self.name,
            "pod_mark": self.pod_mark,
            "agent_mark": self.agent_mark,
            "namespace": self.namespace,
        }))
    }

    /// Render the header document: pod line first, then units, blobs and
    /// resources in order, each line independently JSON-decodable.
    pub fn marshal(
        &self,
        units: &[Unit],
        blobs: &[Blob],
        resources: &[Resource],
    ) -> Result<String, AllocationError> {
        let mut out = String::new();
        out.push_str(POD_PREFIX);
        out.push_str(&self.name);
        out.push(' ');
        out.push_str(&to_compact_json(self)?);
        out.push('\n');

        for unit in units {
            let record = UnitRecord {
                create: unit.transition.create.clone(),
                update: unit.transition.update.clone(),
                destroy: unit.transition.destroy.clone(),
                permanent: unit.transition.permanent,
                runtime: unit.unit_file.runtime,
            };
            out.push_str(UNIT_PREFIX);
            out.push_str(&unit.unit_file.path.to_string_lossy());
            out.push(' ');
            out.push_str(&to_compact_json(&record)?);
            out.push('\n');
        }
        for blob in blobs {
            let record = BlobRecord {
                permissions: blob.permissions,
                leave: blob.leave,
            };
            out.push_str(BLOB_PREFIX);
            out.push_str(&blob.name);
            out.push(' ');
            out.push_str(&to_compact_json(&record)?);
            out.push('\n');
        }
        for resource in resources {
            let record = ResourceRecord {
                required: resource.required,
                config: resource.config.clone(),
            };
            out.push_str(RESOURCE_PREFIX);
            out.push_str(&resource.kind);
            out.push(' ');
            out.push_str(&resource.name);
            out.push(' ');
            out.push_str(&to_compact_json(&record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse a header document. The exact inverse of [`Header::marshal`].
    ///
    /// Trailing non-header lines (the rendered unit body) are tolerated;
    /// any malformed header line fails the whole pod.
    pub fn unmarshal(
        src: &str,
    ) -> Result<(Header, Vec<Unit>, Vec<Blob>, Vec<Resource>), AllocationError> {
        let mut lines = src.lines();
        let first = lines.next().unwrap_or_default();
        let rest = first
            .strip_prefix(POD_PREFIX)
            .ok_or_else(|| AllocationError::Header {
                line: first.to_string(),
            })?;
        let (ids, json) = split_fields(rest, 1, first)?;
        let mut header: Header = from_line_json(json, first)?;
        header.name = ids[0].to_string();

        let mut units = Vec::new();
        let mut blobs = Vec::new();
        let mut resources = Vec::new();
        for line in lines {
            if let Some(rest) = line.strip_prefix(UNIT_PREFIX) {
                let (ids, json) = split_fields(rest, 1, line)?;
                let record: UnitRecord = from_line_json(json, line)?;
                units.push(Unit {
                    unit_file: UnitFile {
                        path: PathBuf::from(ids[0]),
                        source: String::new(),
                        runtime: record.runtime,
                    },
                    transition: Transition {
                        create: record.create,
                        update: record.update,
                        destroy: record.destroy,
                        permanent: record.permanent,
                    },
                });
            } else if let Some(rest) = line.strip_prefix(BLOB_PREFIX) {
                let (ids, json) = split_fields(rest, 1, line)?;
                let record: BlobRecord = from_line_json(json, line)?;
                blobs.push(Blob {
                    name: ids[0].to_string(),
                    permissions: record.permissions,
                    leave: record.leave,
                    source: String::new(),
                });
            } else if let Some(rest) = line.strip_prefix(RESOURCE_PREFIX) {
                let (ids, json) = split_fields(rest, 2, line)?;
                let record: ResourceRecord = from_line_json(json, line)?;
                resources.push(Resource {
                    kind: ids[0].to_string(),
                    name: ids[1].to_string(),
                    required: record.required,
                    config: record.config,
                });
            }
            // anything else is the rendered unit body
        }
        Ok((header, units, blobs, resources))
    }
}

fn to_compact_json<T: Serialize>(value: &T) -> Result<String, AllocationError> {
    serde_json::to_string(value).map_err(|source| AllocationError::Json {
        line: String::new(),
        source,
    })
}

fn from_line_json<'a, T: Deserialize<'a>>(json: &'a str, line: &str) -> Result<T, AllocationError> {
    serde_json::from_str(json).map_err(|source| AllocationError::Json {
        line: line.to_string(),
        source,
    })
}

/// Split `count` whitespace-delimited id fields off the front of a header
/// line remainder, returning the fields and the trailing JSON record.
fn split_fields<'a>(
    rest: &'a str,
    count: usize,
    line: &str,
) -> Result<(Vec<&'a str>, &'a str), AllocationError> {
    let mut remainder = rest.trim_start();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        match remainder.split_once(' ') {
            Some((field, tail)) if !field.is_empty() => {
                fields.push(field);
                remainder = tail.trim_start();
            }
            _ => {
                return Err(AllocationError::Header {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok((fields, remainder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::SystemPaths;

    fn test_parts() -> (Header, Vec<Unit>, Vec<Blob>, Vec<Resource>) {
        let paths = SystemPaths {
            local: PathBuf::from("/local"),
            runtime: PathBuf::from("/runtime"),
        };
        let header = Header {
            name: "pod-1".to_string(),
            pod_mark: 123,
            agent_mark: 456,
            namespace: "private".to_string(),
        };
        let mut unit_file = UnitFile::new("unit-1.service", &paths, true);
        unit_file.source = "[Service]\nExecStart=/usr/bin/sleep inf\n".to_string();
        let units = vec![Unit {
            unit_file,
            transition: Transition::default(),
        }];
        let blobs = vec![Blob {
            name: "/etc/test1".to_string(),
            permissions: 0o644,
            leave: false,
            source: "content".to_string(),
        }];
        let resources = vec![Resource {
            kind: "counter".to_string(),
            name: "main".to_string(),
            required: true,
            config: BTreeMap::from([("count".to_string(), serde_json::json!(3))]),
        }];
        (header, units, blobs, resources)
    }

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let (header, units, blobs, resources) = test_parts();
        let text = header.marshal(&units, &blobs, &resources).unwrap();

        let (parsed_header, parsed_units, parsed_blobs, parsed_resources) =
            Header::unmarshal(&text).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_units.len(), 1);
        assert_eq!(
            parsed_units[0].unit_file.path,
            PathBuf::from("/runtime/unit-1.service")
        );
        assert!(parsed_units[0].unit_file.runtime);
        assert_eq!(parsed_units[0].transition, Transition::default());
        assert_eq!(parsed_blobs.len(), 1);
        assert_eq!(parsed_blobs[0].name, "/etc/test1");
        assert_eq!(parsed_blobs[0].permissions, 0o644);
        assert_eq!(parsed_resources, resources);
    }

    #[test]
    fn test_unmarshal_tolerates_unit_body() {
        let (header, units, blobs, resources) = test_parts();
        let mut text = header.marshal(&units, &blobs, &resources).unwrap();
        text.push_str("[Unit]\nDescription=pod-1\n[Service]\nExecStart=/usr/bin/sleep inf\n");

        let (parsed_header, parsed_units, _, _) = Header::unmarshal(&text).unwrap();
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_units.len(), 1);
    }

    #[test]
    fn test_unmarshal_rejects_missing_pod_line() {
        let err = Header::unmarshal("[Unit]\nDescription=x\n").unwrap_err();
        assert!(matches!(err, AllocationError::Header { .. }));
    }

    #[test]
    fn test_unmarshal_rejects_bad_json() {
        let text = "### POD pod-1 {\"pod_mark\":}\n";
        let err = Header::unmarshal(text).unwrap_err();
        assert!(matches!(err, AllocationError::Json { .. }));
    }

    #[test]
    fn test_unmarshal_fails_whole_pod_on_one_bad_line() {
        let (header, units, blobs, resources) = test_parts();
        let mut text = header.marshal(&units, &blobs, &resources).unwrap();
        text.push_str("### UNIT /runtime/broken.service notjson\n");
        assert!(Header::unmarshal(&text).is_err());
    }

    #[test]
    fn test_marshal_lines_are_independently_decodable() {
        let (header, units, blobs, resources) = test_parts();
        let text = header.marshal(&units, &blobs, &resources).unwrap();
        for line in text.lines() {
            let json = line.rsplit_once(' ').unwrap().1;
            serde_json::from_str::<serde_json::Value>(json).unwrap();
        }
    }
}
