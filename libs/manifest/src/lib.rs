//! # loam-manifest
//!
//! Typed pod manifest model for the loam agent.
//!
//! A manifest describes a **pod**: a named bundle of init-system units,
//! static files ("blobs") and resource claims that is deployed atomically
//! on one node. Manifests arrive from external loaders already parsed;
//! this crate defines the model itself, the constraint language that gates
//! pod eligibility and the `${...}` interpolation used to render unit
//! sources.

mod constraint;
mod interpolate;
pub mod mark;
mod types;

pub use constraint::{Constraint, ConstraintError};
pub use interpolate::interpolate;
pub use types::{Blob, Pod, Resource, Transition, Unit, DEFAULT_TARGET};
