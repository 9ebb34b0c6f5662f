//! Manifest types: pods, units, blobs and resource claims.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::mark;

/// Default install target for pod wrapper units.
pub const DEFAULT_TARGET: &str = "multi-user.target";

const RESOURCE_PREFIX: &str = "resource";
const RESOURCE_REQUEST_PREFIX: &str = "resource.request";

/// A pod manifest: a named bundle of units, blobs and resource claims
/// deployed atomically on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub namespace: String,
    pub name: String,

    /// Deploy units to the runtime unit directory instead of the
    /// persistent one.
    pub runtime: bool,

    /// Install target for the pod wrapper unit.
    pub target: String,

    pub constraint: Constraint,
    pub units: Vec<Unit>,
    pub blobs: Vec<Blob>,
    pub resources: Vec<Resource>,
}

impl Default for Pod {
    fn default() -> Self {
        Self {
            namespace: "private".to_string(),
            name: String::new(),
            runtime: true,
            target: DEFAULT_TARGET.to_string(),
            constraint: Constraint::default(),
            units: Vec::new(),
            blobs: Vec::new(),
            resources: Vec::new(),
        }
    }
}

impl Pod {
    /// Content mark over the manifest's semantic fields. Pods with equal
    /// marks render identically under the same environment.
    pub fn mark(&self) -> u64 {
        mark::digest(&serde_json::to_value(self).expect("pod manifest serialization is infallible"))
    }

    /// Effective eligibility constraint: the pod's own constraint plus the
    /// request and allocation constraints of every resource claim.
    pub fn get_constraint(&self) -> Constraint {
        let mut res = self.constraint.clone();
        for resource in &self.resources {
            res.extend(resource.request_constraint());
            res.extend(resource.allocation_constraint(&self.name));
        }
        res
    }
}

/// A unit manifest: a named init-system unit template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Unit {
    pub name: String,
    /// Unit body template, interpolated at render time.
    pub source: String,
    pub transition: Transition,
}

/// Per-unit policy mapping lifecycle intent to init-system commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transition {
    pub create: String,
    pub update: String,
    pub destroy: String,

    /// Enable the unit in the persistent directory so it survives reboot.
    pub permanent: bool,
}

impl Default for Transition {
    fn default() -> Self {
        Self {
            create: "start".to_string(),
            update: "restart".to_string(),
            destroy: "stop".to_string(),
            permanent: false,
        }
    }
}

/// A static file owned by a pod. `name` is the target path on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blob {
    pub name: String,
    pub permissions: u32,

    /// Preserve the file when the owning pod is destroyed.
    pub leave: bool,

    pub source: String,
}

impl Default for Blob {
    fn default() -> Self {
        Self {
            name: String::new(),
            permissions: 0o644,
            leave: false,
            source: String::new(),
        }
    }
}

/// A named resource claim attached to a pod.
///
/// Claims gate the pod's own eligibility and, once satisfied, contribute
/// allocated facts referenced as `${resource.<kind>.<pod>.<name>...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    pub name: String,

    #[serde(default = "default_required")]
    pub required: bool,

    /// Request configuration, opaque to the agent core.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

fn default_required() -> bool {
    true
}

impl Resource {
    /// Claim ID, unique within a namespace.
    pub fn id(&self, pod_name: &str) -> String {
        format!("{}.{}", pod_name, self.name)
    }

    /// Constraint requiring the node to accept claims of this kind.
    pub fn request_constraint(&self) -> Constraint {
        [(
            format!("${{{}.{}.allow}}", RESOURCE_REQUEST_PREFIX, self.kind),
            "true".to_string(),
        )]
        .into_iter()
        .collect()
    }

    /// Constraint requiring the claim to be allocated before the pod may
    /// be provisioned. Empty for optional claims.
    pub fn allocation_constraint(&self, pod_name: &str) -> Constraint {
        let mut res = Constraint::new();
        if self.required {
            res.insert(
                format!(
                    "${{{}.{}.{}.allocated}}",
                    RESOURCE_PREFIX,
                    self.kind,
                    self.id(pod_name)
                ),
                "true",
            );
        }
        res
    }

    /// Environment key carrying the allocated values payload.
    pub fn values_key(&self, pod_name: &str) -> String {
        format!(
            "{}.{}.{}.__values",
            RESOURCE_PREFIX,
            self.kind,
            self.id(pod_name)
        )
    }
}
