//! # loam-bus
//!
//! Status message plumbing shared by loam components.
//!
//! Producers report named status payloads to [`Consumer`]s. Messages for
//! one producer are ordered; a message with no payload retracts a
//! previously reported name.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// A single status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    payload: Option<BTreeMap<String, String>>,
}

impl Message {
    pub fn new(id: impl Into<String>, payload: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            payload: Some(payload),
        }
    }

    /// A retraction: signals final removal of a previously reported id.
    pub fn retract(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> Option<&BTreeMap<String, String>> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<BTreeMap<String, String>> {
        self.payload
    }
}

/// Anything that accepts status messages.
pub trait Consumer: Send + Sync {
    fn consume(&self, message: Message);
}

impl<T: Consumer + ?Sized> Consumer for Arc<T> {
    fn consume(&self, message: Message) {
        (**self).consume(message)
    }
}

/// Applies a function to each message and forwards the result downstream.
pub struct FnPipe<F> {
    f: F,
    downstream: Vec<Arc<dyn Consumer>>,
}

impl<F> FnPipe<F>
where
    F: Fn(Message) -> Message + Send + Sync,
{
    pub fn new(f: F, downstream: Vec<Arc<dyn Consumer>>) -> Self {
        Self { f, downstream }
    }
}

impl<F> Consumer for FnPipe<F>
where
    F: Fn(Message) -> Message + Send + Sync,
{
    fn consume(&self, message: Message) {
        let message = (self.f)(message);
        for consumer in &self.downstream {
            consumer.consume(message.clone());
        }
    }
}

/// Drops every message.
#[derive(Debug, Default)]
pub struct Blackhole;

impl Consumer for Blackhole {
    fn consume(&self, _message: Message) {}
}

/// Records messages for assertions in tests.
#[derive(Debug, Default)]
pub struct TestingConsumer {
    messages: Mutex<Vec<Message>>,
}

impl TestingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .expect("testing consumer lock poisoned")
            .clone()
    }

    /// Assert the recorded payloads equal `expect`, in order.
    ///
    /// # Panics
    ///
    /// Panics on mismatch.
    pub fn assert_payloads(&self, expect: &[Option<BTreeMap<String, String>>]) {
        let actual: Vec<_> = self
            .messages()
            .into_iter()
            .map(Message::into_payload)
            .collect();
        assert_eq!(actual, expect);
    }

    /// Assert the full recorded message sequence equals `expect`.
    ///
    /// # Panics
    ///
    /// Panics on mismatch.
    pub fn assert_messages(&self, expect: &[Message]) {
        assert_eq!(self.messages(), expect);
    }

    /// Assert the most recent message equals `expect`.
    ///
    /// # Panics
    ///
    /// Panics on mismatch or when nothing was recorded.
    pub fn assert_last(&self, expect: &Message) {
        let messages = self.messages();
        assert_eq!(messages.last(), Some(expect));
    }
}

impl Consumer for TestingConsumer {
    fn consume(&self, message: Message) {
        self.messages
            .lock()
            .expect("testing consumer lock poisoned")
            .push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_message_retract_has_no_payload() {
        let message = Message::retract("pod-1");
        assert_eq!(message.id(), "pod-1");
        assert!(message.payload().is_none());
    }

    #[test]
    fn test_fn_pipe_transforms_and_fans_out() {
        let first = Arc::new(TestingConsumer::new());
        let second = Arc::new(TestingConsumer::new());
        let pipe = FnPipe::new(
            |message: Message| {
                let mut chunk = message.payload().cloned().unwrap_or_default();
                chunk.remove("a");
                Message::new(message.id(), chunk)
            },
            vec![first.clone(), second.clone()],
        );

        pipe.consume(Message::new("test", payload(&[("a", "1"), ("b", "2")])));

        first.assert_payloads(&[Some(payload(&[("b", "2")]))]);
        second.assert_payloads(&[Some(payload(&[("b", "2")]))]);
    }

    #[test]
    fn test_testing_consumer_records_in_order() {
        let consumer = TestingConsumer::new();
        consumer.consume(Message::new("a", payload(&[("k", "1")])));
        consumer.consume(Message::retract("a"));

        consumer.assert_messages(&[
            Message::new("a", payload(&[("k", "1")])),
            Message::retract("a"),
        ]);
        consumer.assert_last(&Message::retract("a"));
    }

    #[test]
    fn test_blackhole_accepts_everything() {
        Blackhole.consume(Message::new("x", payload(&[])));
    }

    #[test]
    fn test_message_serialization() {
        let message = Message::new("pod-1", payload(&[("state", "done")]));
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
