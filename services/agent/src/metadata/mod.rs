//! Metadata constraint manager.
//!
//! Named producers push `{prefix, clean, data}` messages; the manager
//! merges clean sources into per-namespace environments keyed as
//! `<prefix>.<key>`, evaluates gate and consumer constraints, and notifies
//! registered consumers exactly when their effective outcome changes.

mod manager;
mod producer;

pub use manager::{Callback, Manager, Source, SourceMode};
pub use producer::{SimpleProducer, SourceConsumer};

use std::collections::BTreeMap;

/// A producer update: the full data set of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub prefix: String,

    /// `false` marks the data as not yet trustworthy: the source is held
    /// out of merges until a subsequent clean message.
    pub clean: bool,

    pub data: BTreeMap<String, String>,
}
