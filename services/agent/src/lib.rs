//! loam agent library
//!
//! The agent reconciles a declarative set of pod manifests against the
//! local init system and gates that reconciliation behind a metadata
//! constraint manager.
//!
//! ## Architecture
//!
//! - `allocation`: content-addressed pod model, self-describing on-disk
//!   serialization and crash recovery
//! - `metadata`: multi-source namespaced metadata merge and constraint
//!   evaluation
//! - `provision`: reconciliation state machine, instruction compiler and
//!   executor
//! - `systemd`: init-system connection boundary
//!
//! The metadata manager resolves each pod's effective environment and
//! eligibility; the provision evaluator consumes that environment to
//! render, diff and converge allocations. `provision::Sink` wires the two
//! into one pipeline.

pub mod allocation;
pub mod config;
pub mod metadata;
pub mod provision;
pub mod systemd;

pub use provision::{Evaluator, EvaluatorConfig, Sink};
pub use systemd::{MockSystemd, SystemdConnection};
