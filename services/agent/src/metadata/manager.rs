//! Multi-source, namespace-scoped metadata merge and constraint engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use loam_manifest::{mark, Constraint, ConstraintError};
use tracing::{debug, trace};

use super::SourceMessage;

/// How a source's data enters merged environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Keys land in consumer environments as `<prefix>.<key>`.
    Merged,

    /// The source still gates namespace readiness but its data never
    /// enters consumer environments.
    Hidden,
}

/// Declaration of a metadata source.
#[derive(Debug, Clone)]
pub struct Source {
    pub prefix: String,
    pub mode: SourceMode,

    /// Gate constraint, evaluated against the namespace's merged
    /// environment. A failure invalidates every consumer in the
    /// namespaces this source contributes to.
    pub constraint: Option<Constraint>,

    pub namespaces: Vec<String>,
}

impl Source {
    pub fn new(
        prefix: impl Into<String>,
        mode: SourceMode,
        constraint: Option<Constraint>,
        namespaces: &[&str],
    ) -> Self {
        Self {
            prefix: prefix.into(),
            mode,
            constraint,
            namespaces: namespaces.iter().map(|ns| ns.to_string()).collect(),
        }
    }
}

/// Consumer callback: `(error, environment, environment mark)`.
///
/// Exactly one of `error` and `environment` is present.
pub type Callback =
    Box<dyn Fn(Option<ConstraintError>, Option<&BTreeMap<String, String>>, u64) + Send + Sync>;

struct SourceState {
    source: Source,
    message: Option<SourceMessage>,
}

struct ConsumerState {
    name: String,
    namespace: String,
    constraint: Constraint,
    callback: Callback,
    last: Option<Outcome>,
}

/// What a consumer was last told. Duplicate outcomes are suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Env(u64),
    Failure(ConstraintError),
}

struct Inner {
    sources: Vec<SourceState>,
    consumers: Vec<ConsumerState>,
}

/// Merges named sources into per-namespace environments and notifies
/// registered consumers when their effective eligibility or environment
/// changes.
///
/// Notification is synchronous with respect to the triggering update:
/// [`Manager::sync`] returns only after every affected consumer callback
/// has run.
pub struct Manager {
    inner: Mutex<Inner>,
}

impl Manager {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sources: sources
                    .into_iter()
                    .map(|source| SourceState {
                        source,
                        message: None,
                    })
                    .collect(),
                consumers: Vec::new(),
            }),
        }
    }

    /// Consume a producer update and re-evaluate every namespace the
    /// source contributes to.
    pub fn sync(&self, message: SourceMessage) {
        let mut inner = self.inner.lock().expect("metadata manager lock poisoned");
        let Some(state) = inner
            .sources
            .iter_mut()
            .find(|state| state.source.prefix == message.prefix)
        else {
            debug!(prefix = %message.prefix, "update from undeclared source ignored");
            return;
        };
        trace!(prefix = %message.prefix, clean = message.clean, "source update");
        let namespaces = state.source.namespaces.clone();
        state.message = Some(message);
        for namespace in &namespaces {
            Self::evaluate_namespace(&mut inner, namespace, None);
        }
    }

    /// Register a consumer in a namespace under its own constraint.
    ///
    /// The new consumer is evaluated immediately; existing consumers are
    /// not re-notified. Registering the same name again replaces the
    /// previous registration.
    pub fn register_resource(
        &self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        constraint: Constraint,
        callback: Callback,
    ) {
        let name = name.into();
        let namespace = namespace.into();
        let mut inner = self.inner.lock().expect("metadata manager lock poisoned");
        inner
            .consumers
            .retain(|consumer| !(consumer.name == name && consumer.namespace == namespace));
        debug!(resource = %name, namespace = %namespace, "registering resource");
        inner.consumers.push(ConsumerState {
            name: name.clone(),
            namespace: namespace.clone(),
            constraint,
            callback,
            last: None,
        });
        Self::evaluate_namespace(&mut inner, &namespace, Some(&name));
    }

    /// Remove a consumer registration. No final notification is sent.
    pub fn deregister_resource(&self, name: &str, namespace: &str) {
        let mut inner = self.inner.lock().expect("metadata manager lock poisoned");
        debug!(resource = %name, namespace = %namespace, "deregistering resource");
        inner
            .consumers
            .retain(|consumer| !(consumer.name == name && consumer.namespace == namespace));
    }

    /// Re-evaluate one namespace and notify consumers whose outcome
    /// changed. `only` restricts notification to a single consumer (used
    /// at registration).
    fn evaluate_namespace(inner: &mut Inner, namespace: &str, only: Option<&str>) {
        let Inner {
            sources, consumers, ..
        } = inner;

        let contributing: Vec<&SourceState> = sources
            .iter()
            .filter(|state| state.source.namespaces.iter().any(|ns| ns == namespace))
            .collect();

        // Hold all notifications until every contributing source has
        // reported clean data at least once.
        let ready = contributing
            .iter()
            .all(|state| matches!(&state.message, Some(message) if message.clean));
        if !ready {
            trace!(namespace, "namespace not ready");
            return;
        }

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        for state in &contributing {
            if state.source.mode != SourceMode::Merged {
                continue;
            }
            if let Some(message) = &state.message {
                for (key, value) in &message.data {
                    env.insert(format!("{}.{}", state.source.prefix, key), value.clone());
                }
            }
        }

        // Gates run in declaration order; the first failure poisons the
        // whole namespace.
        let mut gate_failure: Option<ConstraintError> = None;
        for state in &contributing {
            if let Some(constraint) = &state.source.constraint {
                if let Err(error) = constraint.check(&env) {
                    trace!(namespace, gate = %state.source.prefix, error = %error, "gate failed");
                    gate_failure = Some(error);
                    break;
                }
            }
        }

        let env_mark = mark::of_map(&env);
        for consumer in consumers
            .iter_mut()
            .filter(|consumer| consumer.namespace == namespace)
        {
            if let Some(only) = only {
                if consumer.name != only {
                    continue;
                }
            }
            let outcome = match &gate_failure {
                Some(error) => Outcome::Failure(error.clone()),
                None => match consumer.constraint.check(&env) {
                    Ok(()) => Outcome::Env(env_mark),
                    Err(error) => Outcome::Failure(error),
                },
            };
            if consumer.last.as_ref() == Some(&outcome) {
                continue;
            }
            consumer.last = Some(outcome.clone());
            match outcome {
                Outcome::Env(mark) => {
                    trace!(resource = %consumer.name, namespace, mark, "notifying environment");
                    (consumer.callback)(None, Some(&env), mark);
                }
                Outcome::Failure(error) => {
                    trace!(resource = %consumer.name, namespace, error = %error, "notifying failure");
                    (consumer.callback)(Some(error), None, env_mark);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SimpleProducer;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        error: Option<String>,
        env: Option<BTreeMap<String, String>>,
        mark: u64,
    }

    type Journal = Arc<Mutex<Vec<Note>>>;

    fn register(manager: &Manager, name: &str, namespace: &str, constraint: Constraint) -> Journal {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let sink = journal.clone();
        manager.register_resource(
            name,
            namespace,
            constraint,
            Box::new(move |error, env, mark| {
                sink.lock().unwrap().push(Note {
                    error: error.map(|e| e.to_string()),
                    env: env.cloned(),
                    mark,
                });
            }),
        );
        journal
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn test_manager() -> (Arc<Manager>, SimpleProducer, SimpleProducer, SimpleProducer) {
        let manager = Arc::new(Manager::new(vec![
            Source::new("meta", SourceMode::Merged, None, &["private", "public"]),
            Source::new("with.dot", SourceMode::Hidden, None, &["private", "public"]),
            Source::new(
                "drain",
                SourceMode::Merged,
                Some([("${drain.state}", "!= true")].into_iter().collect()),
                &["private", "public"],
            ),
        ]));
        let producer = |prefix: &str| {
            let manager = manager.clone();
            SimpleProducer::new(
                prefix,
                vec![Box::new(move |message| manager.sync(message)) as _],
            )
        };
        let meta = producer("meta");
        let dotted = producer("with.dot");
        let drain = producer("drain");
        (manager, meta, dotted, drain)
    }

    #[test]
    fn test_register_notifies_with_merged_environment() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1"), ("second", "1")]));
        dotted.replace(data(&[("first", "1"), ("second", "1")]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        let notes = first.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].error.is_none());
        assert_eq!(
            notes[0].env.as_ref().unwrap(),
            &data(&[("meta.first", "1"), ("meta.second", "1")])
        );
    }

    #[test]
    fn test_second_registration_does_not_renotify_first() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1"), ("second", "1")]));
        dotted.replace(data(&[]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        let second = register(&manager, "second", "private", Constraint::new());

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gate_trips_and_clears_with_stable_mark() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1"), ("second", "1")]));
        dotted.replace(data(&[]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        let second = register(&manager, "second", "private", Constraint::new());
        let mark_before = first.lock().unwrap()[0].mark;

        drain.replace(data(&[("state", "true")]));
        {
            let notes = first.lock().unwrap();
            assert_eq!(notes.len(), 2);
            assert!(notes[1].error.is_some());
            assert!(notes[1].env.is_none());
        }
        assert_eq!(second.lock().unwrap().len(), 2);

        drain.replace(data(&[]));
        {
            let notes = first.lock().unwrap();
            assert_eq!(notes.len(), 3);
            assert!(notes[2].error.is_none());
            assert_eq!(notes[2].mark, mark_before);
            assert_eq!(
                notes[2].env.as_ref().unwrap(),
                &data(&[("meta.first", "1"), ("meta.second", "1")])
            );
        }
    }

    #[test]
    fn test_consumer_constraint_failure_is_delivered() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1"), ("second", "1")]));
        dotted.replace(data(&[]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        let second = register(
            &manager,
            "second",
            "private",
            [("${meta.second}", "1")].into_iter().collect(),
        );

        meta.replace(data(&[("first", "1")]));
        assert_eq!(first.lock().unwrap().len(), 2);
        let second_notes = second.lock().unwrap();
        assert_eq!(second_notes.len(), 2);
        assert!(second_notes[1].error.is_some());
    }

    #[test]
    fn test_duplicate_updates_are_suppressed() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1")]));
        dotted.replace(data(&[]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        meta.replace(data(&[("first", "1")]));
        meta.replace(data(&[("first", "1")]));
        assert_eq!(first.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_hidden_source_data_never_merges() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1")]));
        dotted.replace(data(&[("secret", "x")]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        let notes = first.lock().unwrap();
        assert_eq!(notes[0].env.as_ref().unwrap(), &data(&[("meta.first", "1")]));
    }

    #[test]
    fn test_dirty_source_holds_namespace() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1")]));
        dotted.set(false, data(&[]));
        drain.replace(data(&[]));

        let first = register(&manager, "first", "private", Constraint::new());
        assert!(first.lock().unwrap().is_empty());

        dotted.set(true, data(&[]));
        assert_eq!(first.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unregistered_namespace_is_isolated() {
        let (manager, meta, dotted, drain) = test_manager();
        meta.replace(data(&[("first", "1")]));
        dotted.replace(data(&[]));
        drain.replace(data(&[]));

        let private = register(&manager, "first", "private", Constraint::new());
        let public = register(&manager, "first", "public", Constraint::new());
        assert_eq!(private.lock().unwrap().len(), 1);
        assert_eq!(public.lock().unwrap().len(), 1);

        manager.deregister_resource("first", "public");
        meta.replace(data(&[("first", "2")]));
        assert_eq!(private.lock().unwrap().len(), 2);
        assert_eq!(public.lock().unwrap().len(), 1);
    }
}
