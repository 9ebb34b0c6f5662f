//! Reconciliation state machine over allocated pods.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use loam_bus::{Consumer, Message};
use loam_manifest::mark;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{plan_create, plan_destroy, plan_update, Executor, ProvisionError};
use crate::allocation::{Pod, SystemPaths};
use crate::systemd::SystemdConnection;

/// Evaluator construction parameters.
pub struct EvaluatorConfig {
    pub system_paths: SystemPaths,

    /// Allocations recovered from the unit directories at boot.
    pub recovery: Vec<Pod>,

    /// Environment active at boot. Recovered pods whose stored agent mark
    /// differs are reported dirty: they need re-evaluation before they can
    /// be trusted.
    pub boot_env: BTreeMap<String, String>,

    /// Status consumer; receives one `{present, state}` message per pod
    /// transition and a retraction on final removal.
    pub status: Arc<dyn Consumer>,
}

/// Holds the current allocation set and converges it pod by pod.
///
/// Requests for distinct pod names run concurrently; requests for the
/// same name are serialized on a per-name lock so two batches never
/// interleave writes to the same unit files.
pub struct Evaluator {
    paths: SystemPaths,
    executor: Executor,
    status: Arc<dyn Consumer>,
    allocations: RwLock<HashMap<String, Arc<Pod>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Evaluator {
    /// Seed the evaluator from recovered state and report the initial
    /// status of every recovered pod.
    pub fn new(conn: Arc<dyn SystemdConnection>, config: EvaluatorConfig) -> Self {
        let boot_mark = mark::of_map(&config.boot_env);
        let mut allocations = HashMap::new();
        let mut initial = Vec::new();
        for pod in config.recovery {
            let state = if pod.header.agent_mark == boot_mark {
                "done"
            } else {
                "dirty"
            };
            initial.push((pod.header.name.clone(), state));
            allocations.insert(pod.header.name.clone(), Arc::new(pod));
        }

        let evaluator = Self {
            paths: config.system_paths,
            executor: Executor::new(conn),
            status: config.status,
            allocations: RwLock::new(allocations),
            locks: Mutex::new(HashMap::new()),
        };
        for (name, state) in initial {
            info!(pod = %name, state, "recovered allocation");
            evaluator.report(&name, true, state);
        }
        evaluator
    }

    /// Converge the named pod to its manifest rendered under `env`.
    ///
    /// A missing allocation is created, an allocation with an identical
    /// header is left untouched and anything else is diffed and updated.
    /// The allocation map is only mutated after a fully successful batch.
    pub async fn allocate(
        &self,
        manifest: &loam_manifest::Pod,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ProvisionError> {
        let candidate = Pod::from_manifest(manifest, env, &self.paths)?;
        let name = candidate.header.name.clone();
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        let current = self.allocations.read().await.get(&name).cloned();
        match current {
            None => {
                info!(pod = %name, pod_mark = candidate.header.pod_mark, "creating allocation");
                self.report(&name, true, "create");
                self.executor.execute(&name, plan_create(&candidate)).await?;
                self.allocations
                    .write()
                    .await
                    .insert(name.clone(), Arc::new(candidate));
                self.report(&name, true, "done");
            }
            Some(current) if current.header == candidate.header => {
                debug!(pod = %name, "allocation unchanged");
                self.report(&name, true, "done");
            }
            Some(current) => {
                info!(
                    pod = %name,
                    pod_mark = candidate.header.pod_mark,
                    agent_mark = candidate.header.agent_mark,
                    "updating allocation"
                );
                self.report(&name, true, "update");
                self.executor
                    .execute(&name, plan_update(&current, &candidate))
                    .await?;
                self.allocations
                    .write()
                    .await
                    .insert(name.clone(), Arc::new(candidate));
                self.report(&name, true, "done");
            }
        }
        Ok(())
    }

    /// Destroy the named pod. Unknown names are a silent no-op.
    pub async fn deallocate(&self, name: &str) -> Result<(), ProvisionError> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let current = self.allocations.read().await.get(name).cloned();
        let Some(current) = current else {
            debug!(pod = %name, "deallocate for unknown pod ignored");
            return Ok(());
        };

        info!(pod = %name, "destroying allocation");
        self.report(name, true, "destroy");
        self.executor.execute(name, plan_destroy(&current)).await?;
        self.allocations.write().await.remove(name);
        self.status.consume(Message::retract(name));
        Ok(())
    }

    /// Names of current allocations.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.allocations.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn report(&self, name: &str, present: bool, state: &str) {
        self.status.consume(Message::new(
            name,
            BTreeMap::from([
                ("present".to_string(), present.to_string()),
                ("state".to_string(), state.to_string()),
            ]),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{discover_pod_files, Recovery};
    use crate::systemd::MockSystemd;
    use loam_bus::TestingConsumer;

    fn test_paths(tmp: &tempfile::TempDir) -> SystemPaths {
        SystemPaths {
            local: tmp.path().join("local"),
            runtime: tmp.path().join("runtime"),
        }
    }

    fn test_manifest(name: &str, exec: &str) -> loam_manifest::Pod {
        loam_manifest::Pod {
            name: name.to_string(),
            units: vec![loam_manifest::Unit {
                name: format!("{name}-main.service"),
                source: format!("[Service]\nExecStart={exec}\n"),
                ..loam_manifest::Unit::default()
            }],
            ..loam_manifest::Pod::default()
        }
    }

    fn test_evaluator(
        paths: &SystemPaths,
        recovery: Vec<Pod>,
        boot_env: BTreeMap<String, String>,
    ) -> (Arc<MockSystemd>, Arc<TestingConsumer>, Evaluator) {
        let sd = Arc::new(MockSystemd::new());
        let status = Arc::new(TestingConsumer::new());
        let evaluator = Evaluator::new(
            sd.clone(),
            EvaluatorConfig {
                system_paths: paths.clone(),
                recovery,
                boot_env,
                status: status.clone(),
            },
        );
        (sd, status, evaluator)
    }

    fn status_payload(state: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("present".to_string(), "true".to_string()),
            ("state".to_string(), state.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (sd, status, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());
        let manifest = test_manifest("pod-1", "/usr/bin/sleep inf");
        let env = BTreeMap::new();

        evaluator.allocate(&manifest, &env).await.unwrap();
        let ops_after_create = sd.operations().await.len();
        assert!(ops_after_create > 0);

        evaluator.allocate(&manifest, &env).await.unwrap();
        assert_eq!(sd.operations().await.len(), ops_after_create);

        status.assert_messages(&[
            Message::new("pod-1", status_payload("create")),
            Message::new("pod-1", status_payload("done")),
            Message::new("pod-1", status_payload("done")),
        ]);
    }

    #[tokio::test]
    async fn test_update_touches_only_changed_units() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (sd, _, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());
        let env = BTreeMap::new();

        let mut manifest = test_manifest("pod-1", "/usr/bin/sleep inf");
        manifest.units.push(loam_manifest::Unit {
            name: "steady.service".to_string(),
            source: "[Service]\nExecStart=/usr/bin/sleep 1\n".to_string(),
            ..loam_manifest::Unit::default()
        });
        evaluator.allocate(&manifest, &env).await.unwrap();

        let before = sd.operations().await;
        manifest.units[0].source = "[Service]\nExecStart=/usr/bin/sleep 2\n".to_string();
        evaluator.allocate(&manifest, &env).await.unwrap();
        let after = sd.operations().await;

        let new_ops = &after[before.len()..];
        assert!(new_ops
            .iter()
            .any(|op| op == "restart:pod-private-pod-1.service"));
        assert!(new_ops.iter().any(|op| op == "restart:pod-1-main.service"));
        assert!(!new_ops.iter().any(|op| op.contains("steady.service")));
    }

    #[tokio::test]
    async fn test_deallocate_unknown_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (sd, status, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());

        evaluator.deallocate("pod-missing").await.unwrap();
        assert!(sd.operations().await.is_empty());
        assert!(status.messages().is_empty());
    }

    #[tokio::test]
    async fn test_deallocate_removes_files_and_retracts() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (sd, status, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());
        let manifest = test_manifest("pod-1", "/usr/bin/sleep inf");
        let env = BTreeMap::new();

        evaluator.allocate(&manifest, &env).await.unwrap();
        let wrapper = paths.runtime.join("pod-private-pod-1.service");
        let unit = paths.runtime.join("pod-1-main.service");
        assert!(wrapper.exists());
        assert!(unit.exists());

        evaluator.deallocate("pod-1").await.unwrap();
        assert!(!wrapper.exists());
        assert!(!unit.exists());
        assert!(evaluator.list().await.is_empty());

        let ops = sd.operations().await;
        assert!(ops.iter().any(|op| op == "stop:pod-1-main.service"));
        status.assert_last(&Message::retract("pod-1"));
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_allocation_map() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (sd, _, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());
        sd.fail_unit("pod-1-main.service").await;

        let manifest = test_manifest("pod-1", "/usr/bin/sleep inf");
        let err = evaluator.allocate(&manifest, &BTreeMap::new()).await;
        assert!(err.is_err());
        assert!(evaluator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_reports_dirty_once() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let env = BTreeMap::new();

        // first life: deploy pod-1
        {
            let (_, _, evaluator) = test_evaluator(&paths, Vec::new(), env.clone());
            evaluator
                .allocate(&test_manifest("pod-1", "/usr/bin/sleep inf"), &env)
                .await
                .unwrap();
        }

        // second life: recover under a different environment
        let recovery = Recovery::scan(&paths, || discover_pod_files(&paths));
        assert_eq!(recovery.pods.len(), 1);
        let boot_env =
            BTreeMap::from([("meta.rack".to_string(), "r2".to_string())]);
        let (_, status, _evaluator) = test_evaluator(&paths, recovery.pods, boot_env);

        status.assert_messages(&[Message::new("pod-1", status_payload("dirty"))]);
    }

    #[tokio::test]
    async fn test_recovery_with_matching_env_is_done() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let env = BTreeMap::from([("meta.rack".to_string(), "r1".to_string())]);

        {
            let (_, _, evaluator) = test_evaluator(&paths, Vec::new(), env.clone());
            evaluator
                .allocate(&test_manifest("pod-1", "/usr/bin/sleep inf"), &env)
                .await
                .unwrap();
        }

        let recovery = Recovery::scan(&paths, || discover_pod_files(&paths));
        let (_, status, _evaluator) = test_evaluator(&paths, recovery.pods, env);
        status.assert_messages(&[Message::new("pod-1", status_payload("done"))]);
    }

    #[tokio::test]
    async fn test_concurrent_distinct_pods() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = test_paths(&tmp);
        let (_, _, evaluator) = test_evaluator(&paths, Vec::new(), BTreeMap::new());
        let evaluator = Arc::new(evaluator);
        let env = BTreeMap::new();

        let mut handles = Vec::new();
        for name in ["pod-1", "pod-2", "pod-3"] {
            let evaluator = evaluator.clone();
            let manifest = test_manifest(name, "/usr/bin/sleep inf");
            let env = env.clone();
            handles.push(tokio::spawn(async move {
                evaluator.allocate(&manifest, &env).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(evaluator.list().await, vec!["pod-1", "pod-2", "pod-3"]);
    }
}
