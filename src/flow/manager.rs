use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::active::Flow;
use super::config::FlowConfig;
use super::diff::{FlowDiff, diff_configs};
use crate::descriptor::NodeDescriptor;
use crate::error::{FlowError, RegistryError, missing_types_report};
use crate::message::Message;
use crate::node::{Node, NodeStatus};
use crate::runtime::Runtime;
use crate::storage::Storage;

/// How much of the running system a deploy replaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Stop everything, start everything.
    #[default]
    Full,
    /// Restart changed and deleted nodes only.
    Nodes,
    /// Like `Nodes`, plus every node linked to one of them.
    Flows,
    /// Boot-time apply of what storage already holds; nothing is saved.
    Load,
}

/// Owns one [`Flow`] per tab plus the global flow and applies deploys.
pub struct FlowManager {
    runtime: Arc<Runtime>,
    storage: Arc<dyn Storage>,
    deploy: Mutex<()>,
    flows: DashMap<String, Arc<Flow>>,
    active: RwLock<Option<Arc<FlowConfig>>>,
    started: AtomicBool,
    /// Types registered while a deploy held the lock, replayed once it ends.
    deferred_types: SyncMutex<Vec<String>>,
}

impl FlowManager {
    pub fn new(runtime: Arc<Runtime>, storage: Arc<dyn Storage>) -> Arc<Self> {
        let manager = Arc::new(Self {
            runtime,
            storage,
            deploy: Mutex::new(()),
            flows: DashMap::new(),
            active: RwLock::new(None),
            started: AtomicBool::new(false),
            deferred_types: SyncMutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&manager);
        manager.runtime.registry().on_type_registered(move |type_name| {
            if let Some(manager) = weak.upgrade() {
                manager.type_registered(type_name);
            }
        });
        manager
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Reads flows and credentials from storage and runs them.
    pub async fn load(&self) -> Result<(), FlowError> {
        self.runtime.credentials().load().await?;
        let flows = self.storage.get_flows().await?;
        info!("loaded {} flow descriptors", flows.len());
        self.set_config(flows, DeployMode::Load).await?;
        Ok(())
    }

    /// Deploys `descriptors`.
    ///
    /// Credentials are moved into the credential store, the stripped list is
    /// saved (except for [`DeployMode::Load`]) and the running flows are
    /// brought in line with it. Returns the diff for `Nodes`/`Flows`
    /// deploys that had something to compare against.
    ///
    /// A storage failure is returned before anything is stopped, but
    /// credentials extracted so far stay in the in-memory cache.
    pub async fn set_config(
        &self,
        descriptors: Vec<NodeDescriptor>,
        mode: DeployMode,
    ) -> Result<Option<FlowDiff>, FlowError> {
        let result = {
            let _deploy = self.deploy.lock().await;
            self.apply(descriptors, mode).await
        };
        self.replay_deferred();
        result
    }

    async fn apply(&self, descriptors: Vec<NodeDescriptor>, mode: DeployMode) -> Result<Option<FlowDiff>, FlowError> {
        let credentials = self.runtime.credentials();

        let mut cleaned = descriptors.clone();
        let mut extracted = false;
        for node in &mut cleaned {
            extracted |= credentials.extract(node);
        }
        if extracted {
            credentials.save().await?;
        }
        if mode != DeployMode::Load {
            self.storage.save_flows(&cleaned).await?;
        }

        let mut config = FlowConfig::parse(&descriptors, self.runtime.registry());
        let previous = self.active.read().clone();
        let diff = match (mode, previous) {
            (DeployMode::Nodes | DeployMode::Flows, Some(old)) => Some(diff_configs(&old, &config)),
            _ => None,
        };
        config.strip_credentials();
        let config = Arc::new(config);
        credentials.clean(&cleaned).await?;
        *self.active.write() = Some(config.clone());

        if !config.missing_types.is_empty() {
            warn!("{}", missing_types_report(&config.missing_types));
        }
        match &diff {
            Some(diff) => {
                let restart = match mode {
                    DeployMode::Flows => diff.restart_set_with_linked(),
                    _ => diff.restart_set(),
                };
                let restart: Vec<String> = restart.into_iter().collect();
                info!(?mode, restart = restart.len(), rewire = diff.wiring_changed.len(), "applying partial deploy");
                for flow in self.snapshot() {
                    flow.stop(Some(&restart)).await;
                }
            }
            None => {
                info!(?mode, nodes = config.order.len(), "applying full deploy");
                for flow in self.snapshot() {
                    flow.stop(None).await;
                }
            }
        }
        self.drop_vanished(&config).await;
        self.start_all(&config, diff.as_ref());
        Ok(diff)
    }

    /// Starts every flow of the active configuration that is not running.
    pub async fn start_flows(&self) {
        {
            let _deploy = self.deploy.lock().await;
            let active = self.active.read().clone();
            match active {
                Some(config) => self.start_all(&config, None),
                None => warn!("no flows to start"),
            }
        }
        self.replay_deferred();
    }

    /// Stops every flow and waits for all close handlers to settle.
    pub async fn stop_flows(&self) {
        {
            let _deploy = self.deploy.lock().await;
            for flow in self.snapshot() {
                flow.stop(None).await;
            }
            self.started.store(false, Ordering::SeqCst);
            info!("stopped flows");
        }
        self.replay_deferred();
    }

    /// The active deploy, without credentials.
    pub fn get_flows(&self) -> Vec<NodeDescriptor> {
        self.active
            .read()
            .as_ref()
            .map(|config| config.descriptors())
            .unwrap_or_default()
    }

    pub fn each_node(&self, mut f: impl FnMut(&NodeDescriptor)) {
        if let Some(config) = self.active.read().as_ref() {
            config.order.iter().filter_map(|id| config.node(id)).for_each(&mut f);
        }
    }

    /// A live node, looked up through the flow that owns it.
    pub fn get_node(&self, id: &str) -> Option<Arc<Node>> {
        let flow_id = self.runtime.flow_of(id)?;
        self.flows.get(&flow_id)?.node(id)
    }

    pub fn flow(&self, id: &str) -> Option<Arc<Flow>> {
        self.flows.get(id).map(|f| f.value().clone())
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handle_error(&self, node: &Node, text: &str, msg: Option<&Message>) -> bool {
        self.runtime.handle_error(node, text, msg)
    }

    pub fn handle_status(&self, node: &Node, status: &NodeStatus) -> bool {
        self.runtime.handle_status(node, status)
    }

    /// Disables a node module unless the active deploy still uses it.
    pub async fn disable_module(&self, module: &str) -> Result<Vec<String>, RegistryError> {
        let deployed = self.get_flows();
        self.runtime.registry().disable_module(module, &deployed).await
    }

    /// Forwards a registration to every flow, or parks it while a deploy
    /// is rebuilding them.
    fn type_registered(&self, type_name: &str) {
        let Ok(_deploy) = self.deploy.try_lock() else {
            debug!(kind = type_name, "deploy in progress, deferring type registration");
            self.deferred_types.lock().push(type_name.to_string());
            return;
        };
        for flow in self.snapshot() {
            flow.type_registered(type_name);
        }
    }

    fn replay_deferred(&self) {
        let deferred = std::mem::take(&mut *self.deferred_types.lock());
        for type_name in deferred {
            self.type_registered(&type_name);
        }
    }

    fn snapshot(&self) -> Vec<Arc<Flow>> {
        self.flows.iter().map(|f| f.value().clone()).collect()
    }

    async fn drop_vanished(&self, config: &FlowConfig) {
        let vanished: Vec<String> = self
            .flows
            .iter()
            .filter(|f| !config.has_flow(f.key()))
            .map(|f| f.key().clone())
            .collect();
        for id in vanished {
            if let Some((_, flow)) = self.flows.remove(&id) {
                flow.stop(None).await;
                info!(flow = %id, "removed flow");
            }
        }
    }

    fn start_all(&self, config: &Arc<FlowConfig>, diff: Option<&FlowDiff>) {
        let mut waiting = HashSet::new();
        for id in config.flow_ids() {
            let existing = self.flows.get(&id).map(|f| f.value().clone());
            let flow = match existing {
                Some(flow) => {
                    flow.update(config.clone());
                    flow
                }
                None => {
                    let flow = Flow::new(&id, self.runtime.clone(), config.clone());
                    self.flows.insert(id.clone(), flow.clone());
                    flow
                }
            };
            match flow.start(diff) {
                Ok(()) => {}
                Err(FlowError::MissingTypes(types)) => waiting.extend(types),
                Err(e) => warn!(flow = %id, "flow not started: {e}"),
            }
        }
        if !waiting.is_empty() {
            let mut waiting: Vec<String> = waiting.into_iter().collect();
            waiting.sort();
            info!("{}", missing_types_report(&waiting));
        }
        self.started.store(true, Ordering::SeqCst);
        info!(flows = self.flows.len(), nodes = self.runtime.node_count(), "started flows");
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("flows", &self.flows.len())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::config::GLOBAL_FLOW_ID;
    use crate::nodes::testing::{Passthrough, TestBed};
    use crate::registry::RegisterOptions;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    fn manager(bed: &TestBed) -> Arc<FlowManager> {
        FlowManager::new(bed.runtime.clone(), bed.storage.clone())
    }

    fn two_tabs() -> Vec<NodeDescriptor> {
        vec![
            NodeDescriptor::new("t1", "tab"),
            NodeDescriptor::new("t2", "tab"),
            NodeDescriptor::new("cfg", "config"),
            NodeDescriptor::new("a", "rec").with_z("t1").with_wires([["b"]]),
            NodeDescriptor::new("b", "sink").with_z("t1"),
            NodeDescriptor::new("c", "rec").with_z("t2"),
        ]
    }

    #[tokio::test]
    async fn full_deploy_saves_and_starts_every_flow() {
        let bed = TestBed::new();
        let flows = manager(&bed);
        let diff = flows.set_config(two_tabs(), DeployMode::Full).await.unwrap();
        assert!(diff.is_none());
        assert!(flows.is_started());
        assert_eq!(bed.storage.flow_saves(), 1);
        assert_eq!(flows.flow_ids(), vec![GLOBAL_FLOW_ID, "t1", "t2"]);
        assert_eq!(flows.flow("t1").unwrap().active_ids(), vec!["a", "b"]);
        assert_eq!(flows.flow(GLOBAL_FLOW_ID).unwrap().active_ids(), vec!["cfg"]);
        assert_eq!(flows.get_node("c").unwrap().z(), Some("t2"));
        assert!(flows.get_node("t1").is_none());
        assert_eq!(flows.get_flows().len(), 6);

        let mut types = Vec::new();
        flows.each_node(|n| types.push(n.type_name.clone()));
        assert_eq!(types, vec!["tab", "tab", "config", "rec", "sink", "rec"]);
    }

    #[tokio::test]
    async fn credentials_never_reach_flow_storage() {
        let bed = TestBed::new();
        bed.runtime
            .credentials()
            .register("rec", [("token".to_string(), crate::credentials::CredentialField::password())].into());
        let flows = manager(&bed);
        let mut list = two_tabs();
        list[3] = list[3].clone().with_credentials(json!({"token": "s3cret"}).as_object().cloned().unwrap());
        flows.set_config(list, DeployMode::Full).await.unwrap();

        let stored = bed.storage.get_flows().await.unwrap();
        assert!(stored.iter().all(|n| n.credentials.is_none()));
        assert!(flows.get_flows().iter().all(|n| n.credentials.is_none()));
        assert_eq!(bed.storage.stored_credentials()["a"]["token"], "s3cret");
        assert_eq!(flows.get_node("a").unwrap().credentials().unwrap()["token"], "s3cret");
    }

    #[tokio::test]
    async fn load_applies_storage_without_saving() {
        let stored = MemoryStorage::with_flows(two_tabs())
            .with_credentials([("c".to_string(), json!({"k": "v"}).as_object().cloned().unwrap())].into());
        let storage = Arc::new(stored);
        let bed = TestBed::with_storage(storage.clone());
        let flows = manager(&bed);
        flows.load().await.unwrap();

        assert_eq!(storage.flow_saves(), 0);
        assert_eq!(flows.flow("t2").unwrap().active_ids(), vec!["c"]);
        assert_eq!(flows.get_node("c").unwrap().credentials().unwrap()["k"], "v");
    }

    #[tokio::test]
    async fn vanished_tabs_are_stopped_and_dropped() {
        let bed = TestBed::new();
        let flows = manager(&bed);
        flows.set_config(two_tabs(), DeployMode::Full).await.unwrap();
        let without_t2: Vec<_> = two_tabs().into_iter().filter(|n| n.id != "t2" && n.id != "c").collect();
        let diff = flows.set_config(without_t2, DeployMode::Nodes).await.unwrap().unwrap();

        assert!(diff.deleted.contains("c"));
        assert!(!diff.deleted.contains("t2"));
        assert!(flows.flow("t2").is_none());
        assert!(bed.runtime.flow("t2").is_none());
        assert!(bed.runtime.node("c").is_none());
        assert_eq!(bed.journal.closed("c"), 1);
        assert_eq!(bed.journal.closed("a"), 0);
    }

    #[tokio::test]
    async fn registering_a_missing_type_starts_waiting_flows() {
        let bed = TestBed::new();
        let flows = manager(&bed);
        let mut list = two_tabs();
        list.push(NodeDescriptor::new("m", "mqtt in").with_z("t2"));
        flows.set_config(list, DeployMode::Full).await.unwrap();

        assert!(flows.flow("t2").unwrap().active_ids().is_empty());
        assert_eq!(flows.flow("t1").unwrap().active_ids(), vec!["a", "b"]);

        bed.runtime
            .registry()
            .register("mqtt in", Arc::new(Passthrough), RegisterOptions::module("mqtt"))
            .unwrap();
        assert_eq!(flows.flow("t2").unwrap().active_ids(), vec!["c", "m"]);
    }

    fn late_type_generation(stamp: &str) -> Vec<NodeDescriptor> {
        vec![
            NodeDescriptor::new("t1", "tab"),
            NodeDescriptor::new("t2", "tab"),
            NodeDescriptor::new("s", "slow-close").with_z("t1").with_prop("stamp", json!(stamp)),
            NodeDescriptor::new("m", "later").with_z("t2"),
            NodeDescriptor::new("old", "rec").with_z("t2").with_prop("stamp", json!(stamp)),
        ]
    }

    #[tokio::test]
    async fn type_registered_during_a_deploy_is_not_lost() {
        for mode in [DeployMode::Full, DeployMode::Nodes] {
            let bed = TestBed::new();
            let flows = manager(&bed);
            flows.set_config(late_type_generation("v1"), DeployMode::Full).await.unwrap();
            assert_eq!(flows.flow("t2").unwrap().missing_types(), vec!["later"]);

            let register = async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                bed.runtime
                    .registry()
                    .register("later", Arc::new(Passthrough), RegisterOptions::module("late"))
                    .unwrap();
            };
            let (deployed, ()) = tokio::join!(flows.set_config(late_type_generation("v2"), mode), register);
            deployed.unwrap();

            let t2 = flows.flow("t2").unwrap();
            assert!(t2.missing_types().is_empty(), "{mode:?}");
            assert_eq!(t2.active_ids(), vec!["m", "old"], "{mode:?}");
            assert_eq!(bed.journal.created("old"), 1, "{mode:?}");
            flows.get_node("old").unwrap().receive(Message::with_payload(json!(1)));
            assert_eq!(bed.journal.messages("old")[0].get("stamp"), Some(&json!("v2")), "{mode:?}");
        }
    }

    #[tokio::test]
    async fn stop_and_start_flows_cycle_every_node() {
        let bed = TestBed::new();
        let flows = manager(&bed);
        flows.set_config(two_tabs(), DeployMode::Full).await.unwrap();
        flows.stop_flows().await;
        assert!(!flows.is_started());
        assert_eq!(bed.runtime.node_count(), 0);

        flows.start_flows().await;
        assert_eq!(bed.runtime.node_count(), 4);
        assert_eq!(bed.journal.created("a"), 2);
    }

    #[tokio::test]
    async fn modules_in_use_cannot_be_disabled() {
        let bed = TestBed::new();
        let flows = manager(&bed);
        flows.set_config(two_tabs(), DeployMode::Full).await.unwrap();
        let err = flows.disable_module("test").await.unwrap_err();
        assert!(matches!(err, RegistryError::TypeInUse { .. }));

        flows.set_config(vec![NodeDescriptor::new("t1", "tab")], DeployMode::Full).await.unwrap();
        let disabled = flows.disable_module("test").await.unwrap();
        assert!(disabled.contains(&"rec".to_string()));
        assert!(!bed.runtime.registry().is_available("rec"));
    }
}
