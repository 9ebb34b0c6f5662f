//! Simple in-process metadata producer.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::trace;

use super::SourceMessage;

/// Receiver side of a producer; typically `Manager::sync` behind a
/// closure.
pub type SourceConsumer = Box<dyn Fn(SourceMessage) + Send + Sync>;

/// Owns one source's data set and pushes every mutation to its consumers.
///
/// Dispatch is synchronous: a mutating call returns only after every
/// consumer has observed the new state.
pub struct SimpleProducer {
    prefix: String,
    consumers: Vec<SourceConsumer>,
    state: Mutex<ProducerState>,
}

#[derive(Default)]
struct ProducerState {
    data: BTreeMap<String, String>,
    clean: bool,
}

impl SimpleProducer {
    pub fn new(prefix: impl Into<String>, consumers: Vec<SourceConsumer>) -> Self {
        Self {
            prefix: prefix.into(),
            consumers,
            state: Mutex::new(ProducerState::default()),
        }
    }

    /// Replace the whole data set. The source becomes clean.
    pub fn replace(&self, data: BTreeMap<String, String>) {
        let mut state = self.state.lock().expect("producer lock poisoned");
        state.data = data;
        state.clean = true;
        self.notify(&state);
    }

    /// Upsert keys. `clean` marks whether the resulting data set is
    /// trustworthy.
    pub fn set(&self, clean: bool, data: BTreeMap<String, String>) {
        let mut state = self.state.lock().expect("producer lock poisoned");
        state.data.extend(data);
        state.clean = clean;
        self.notify(&state);
    }

    /// Remove keys.
    pub fn delete(&self, clean: bool, keys: &[&str]) {
        let mut state = self.state.lock().expect("producer lock poisoned");
        for key in keys {
            state.data.remove(*key);
        }
        state.clean = clean;
        self.notify(&state);
    }

    fn notify(&self, state: &ProducerState) {
        trace!(prefix = %self.prefix, consumers = self.consumers.len(), "syncing");
        for consumer in &self.consumers {
            consumer(SourceMessage {
                prefix: self.prefix.clone(),
                clean: state.clean,
                data: state.data.clone(),
            });
        }
    }
}
