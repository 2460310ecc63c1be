use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::comms::{Comms, RetainedComms};
use crate::config::{MemorySettings, Settings};
use crate::credentials::CredentialStore;
use crate::events::{Listeners, RuntimeEvent};
use crate::flow::active::Flow;
use crate::logger::Logger;
use crate::message::Message;
use crate::node::{Node, NodeStatus};
use crate::nodes;
use crate::registry::TypeRegistry;
use crate::storage::Storage;

/// Shared context of one runtime instance: collaborators, the routing
/// directory used by `send`, and the index from nodes to their flows.
pub struct Runtime {
    registry: Arc<TypeRegistry>,
    credentials: Arc<CredentialStore>,
    comms: Comms,
    logger: Logger,
    events: Listeners<RuntimeEvent>,
    nodes: DashMap<String, Arc<Node>>,
    flows: DashMap<String, Weak<Flow>>,
    node_flows: DashMap<String, String>,
}

impl Runtime {
    pub fn new(
        registry: Arc<TypeRegistry>,
        credentials: Arc<CredentialStore>,
        comms: Comms,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            credentials,
            comms,
            logger,
            events: Listeners::new(),
            nodes: DashMap::new(),
            flows: DashMap::new(),
            node_flows: DashMap::new(),
        })
    }

    /// A self-contained runtime over `storage` with in-memory settings, a
    /// retained comms hub and the built-in node types registered.
    pub fn in_memory(storage: Arc<dyn Storage>) -> (Arc<Self>, Arc<RetainedComms>) {
        let credentials = Arc::new(CredentialStore::new(storage));
        let registry = Arc::new(TypeRegistry::new(
            Some(Settings(MemorySettings::new())),
            Some(credentials.clone()),
        ));
        nodes::register_builtins(&registry);
        let hub = RetainedComms::new();
        let runtime = Self::new(registry, credentials, Comms(hub.clone()), Logger::default());
        (runtime, hub)
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn comms(&self) -> &Comms {
        &self.comms
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Lifecycle notifications (`nodes-starting` and friends).
    pub fn events(&self) -> &Listeners<RuntimeEvent> {
        &self.events
    }

    /// The live instance with this id, from any flow.
    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Id of the flow owning a live node.
    pub fn flow_of(&self, node_id: &str) -> Option<String> {
        self.node_flows.get(node_id).map(|f| f.value().clone())
    }

    pub fn flow(&self, flow_id: &str) -> Option<Arc<Flow>> {
        self.flows.get(flow_id).and_then(|f| f.upgrade())
    }

    pub(crate) fn insert_node(&self, node: Arc<Node>) {
        self.nodes.insert(node.id().to_string(), node);
    }

    pub(crate) fn remove_node(&self, id: &str) {
        self.nodes.remove(id);
        self.node_flows.remove(id);
    }

    pub(crate) fn index_node(&self, node_id: &str, flow_id: &str) {
        self.node_flows.insert(node_id.to_string(), flow_id.to_string());
    }

    pub(crate) fn attach_flow(&self, flow: &Arc<Flow>) {
        self.flows.insert(flow.id().to_string(), Arc::downgrade(flow));
    }

    /// Forgets `flow_id` unless a live flow has since taken the id.
    pub(crate) fn detach_flow(&self, flow_id: &str) {
        self.flows.remove_if(flow_id, |_, flow| flow.strong_count() == 0);
    }

    /// Flow responsible for nodes whose `z` is `scope`: the tab itself, or
    /// the flow owning the subflow instance `scope` names.
    fn flow_for_scope(&self, scope: &str) -> Option<Arc<Flow>> {
        self.flow(scope).or_else(|| self.flow_of(scope).and_then(|f| self.flow(&f)))
    }

    /// Routes a node error to its flow's catch nodes. Returns whether any
    /// catch node received it.
    pub fn handle_error(&self, node: &Node, text: &str, msg: Option<&Message>) -> bool {
        let handled = node
            .z()
            .and_then(|z| self.flow_for_scope(z))
            .is_some_and(|flow| flow.handle_error(node, text, msg));
        if !handled {
            debug!(node = %node.id(), "error not caught: {text}");
        }
        handled
    }

    pub fn handle_status(&self, node: &Node, status: &NodeStatus) -> bool {
        node.z()
            .and_then(|z| self.flow_for_scope(z))
            .is_some_and(|flow| flow.handle_status(node, status))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("nodes", &self.nodes.len())
            .field("flows", &self.flows.len())
            .finish()
    }
}
