//! Glue between the metadata manager and the evaluator.
//!
//! The sink owns the desired pod set: every pod is registered with the
//! manager under its effective constraint, and manager callbacks are
//! converted into allocate and deallocate calls. This is what makes the
//! two subsystems one pipeline: a pod is only rendered under an
//! environment the manager has resolved and approved.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::metadata::Manager;
use crate::provision::Evaluator;

enum SinkEvent {
    Eligible {
        name: String,
        env: BTreeMap<String, String>,
    },
    Ineligible {
        name: String,
        reason: String,
    },
}

/// Drives the evaluator from manager notifications.
pub struct Sink {
    evaluator: Arc<Evaluator>,
    manager: Arc<Manager>,
    tx: mpsc::UnboundedSender<SinkEvent>,
    desired: Mutex<HashMap<String, loam_manifest::Pod>>,
}

impl Sink {
    /// Create the sink and spawn its dispatch task.
    pub fn new(evaluator: Arc<Evaluator>, manager: Arc<Manager>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            evaluator,
            manager,
            tx,
            desired: Mutex::new(HashMap::new()),
        });
        let dispatch = sink.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch.handle(event).await;
            }
        });
        sink
    }

    /// Replace the desired pod set.
    ///
    /// New and changed pods are registered with the manager; pods missing
    /// from the new set are deregistered and deallocated.
    pub fn sync(&self, pods: Vec<loam_manifest::Pod>) {
        let mut desired = self.desired.lock().expect("sink lock poisoned");

        let removed: Vec<(String, String)> = desired
            .values()
            .filter(|manifest| !pods.iter().any(|pod| pod.name == manifest.name))
            .map(|manifest| (manifest.name.clone(), manifest.namespace.clone()))
            .collect();
        for (name, namespace) in removed {
            self.manager.deregister_resource(&name, &namespace);
            desired.remove(&name);
            let _ = self.tx.send(SinkEvent::Ineligible {
                name,
                reason: "removed from registry".to_string(),
            });
        }

        for pod in pods {
            let name = pod.name.clone();
            let namespace = pod.namespace.clone();
            let constraint = pod.get_constraint();
            desired.insert(name.clone(), pod);

            let tx = self.tx.clone();
            let resource = name.clone();
            self.manager.register_resource(
                name,
                namespace,
                constraint,
                Box::new(move |err, env, _mark| {
                    let event = match (err, env) {
                        (None, Some(env)) => SinkEvent::Eligible {
                            name: resource.clone(),
                            env: env.clone(),
                        },
                        (Some(err), _) => SinkEvent::Ineligible {
                            name: resource.clone(),
                            reason: err.to_string(),
                        },
                        (None, None) => return,
                    };
                    let _ = tx.send(event);
                }),
            );
        }
    }

    async fn handle(&self, event: SinkEvent) {
        match event {
            SinkEvent::Eligible { name, env } => {
                let manifest = {
                    self.desired
                        .lock()
                        .expect("sink lock poisoned")
                        .get(&name)
                        .cloned()
                };
                let Some(manifest) = manifest else {
                    return;
                };
                // the wrapper template consumes the agent's exec line as
                // ${system.pod_exec}
                let mut env = env;
                if let Some(exec) = env.get("agent.pod_exec").cloned() {
                    env.insert("system.pod_exec".to_string(), exec);
                }
                if let Err(err) = self.evaluator.allocate(&manifest, &env).await {
                    error!(pod = %name, error = %err, "allocation failed");
                }
            }
            SinkEvent::Ineligible { name, reason } => {
                debug!(pod = %name, %reason, "pod ineligible, deallocating");
                if let Err(err) = self.evaluator.deallocate(&name).await {
                    error!(pod = %name, error = %err, "deallocation failed");
                }
            }
        }
    }
}
