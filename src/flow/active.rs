use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::FlowConfig;
use super::diff::FlowDiff;
use super::subflow::SubflowInstance;
use crate::descriptor::NodeDescriptor;
use crate::error::FlowError;
use crate::events::RuntimeEvent;
use crate::message::Message;
use crate::node::{Closing, Node, NodeStatus, panic_message};
use crate::nodes::{CATCH_TYPE, STATUS_TYPE};
use crate::registry::TypeLookup;
use crate::runtime::Runtime;
use crate::util::map_env_vars;

/// An error report that has bounced through catch handling this many times
/// is dropped.
const MAX_CATCH_COUNT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Catch,
    Status,
}

struct Handler {
    kind: HandlerKind,
    node: Arc<Node>,
    scope: Option<Vec<String>>,
}

struct FlowState {
    config: Arc<FlowConfig>,
    missing_types: Vec<String>,
    started: bool,
    instances: HashMap<String, SubflowInstance>,
}

/// The live instances of one tab (or of the global scope).
pub struct Flow {
    id: String,
    runtime: Arc<Runtime>,
    state: Mutex<FlowState>,
    active: DashMap<String, Arc<Node>>,
    handlers: RwLock<Vec<Handler>>,
}

impl Flow {
    pub fn new(id: &str, runtime: Arc<Runtime>, config: Arc<FlowConfig>) -> Arc<Self> {
        let missing_types = unresolved(&runtime, config.missing_types_for(id));
        let flow = Arc::new(Self {
            id: id.to_string(),
            runtime,
            state: Mutex::new(FlowState {
                config,
                missing_types,
                started: false,
                instances: HashMap::new(),
            }),
            active: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
        });
        flow.runtime.attach_flow(&flow);
        flow
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn missing_types(&self) -> Vec<String> {
        self.state.lock().missing_types.clone()
    }

    /// Swaps in the next deploy generation. Live nodes are untouched until
    /// the following `stop`/`start`. Types registered since the
    /// configuration was parsed no longer count as missing.
    pub fn update(&self, config: Arc<FlowConfig>) {
        let missing_types = unresolved(&self.runtime, config.missing_types_for(&self.id));
        let mut state = self.state.lock();
        state.missing_types = missing_types;
        state.config = config;
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.active.get(id).map(|n| n.value().clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Instantiates every node of this flow that is not already running.
    ///
    /// With a diff, nodes listed as `wiring_changed` that are still live get
    /// their new wiring in place first. Fails while types are missing; the
    /// flow then starts on its own once they are registered.
    pub fn start(&self, diff: Option<&FlowDiff>) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock();
            state.started = true;
            let registry = self.runtime.registry();
            state.missing_types.retain(|t| !registry.is_available(t));
            if !state.missing_types.is_empty() {
                return Err(FlowError::MissingTypes(state.missing_types.clone()));
            }
        }
        self.runtime.events().emit(&RuntimeEvent::NodesStarting);

        let mut state = self.state.lock();
        let config = state.config.clone();
        if let Some(diff) = diff {
            for id in &diff.wiring_changed {
                let Some(desc) = config.node(id) else {
                    continue;
                };
                if let Some(instance) = state.instances.get_mut(id) {
                    instance.update_wires(desc.wires.clone());
                } else if let Some(node) = self.node(id) {
                    node.update_wires(desc.wires.clone());
                }
            }
        }

        let mut created = 0;
        for desc in config.scope(&self.id) {
            if self.active.contains_key(&desc.id) {
                continue;
            }
            if desc.subflow_template_id().is_some() {
                let mut create = |d: &NodeDescriptor| self.create_node(d);
                match SubflowInstance::build(desc, &config, &self.runtime, &mut create) {
                    Ok(instance) => {
                        debug!(flow = %self.id, node = %desc.id, template = instance.template_id(), "subflow instance created");
                        self.track(instance.router().clone());
                        for router in instance.nested_routers() {
                            self.track(router);
                        }
                        state.instances.insert(desc.id.clone(), instance);
                        created += 1;
                    }
                    Err(e) => warn!(flow = %self.id, node = %desc.id, "subflow instance not created: {e}"),
                }
            } else if self.create_node(desc).is_some() {
                created += 1;
            }
        }
        drop(state);

        debug!(flow = %self.id, created, active = self.active.len(), "flow started");
        self.runtime.events().emit(&RuntimeEvent::NodesStarted);
        Ok(())
    }

    /// Closes the listed nodes (all when `None`) and waits for every close
    /// to settle. Listing a subflow usage stops its whole instance. Close
    /// failures are reported through the failing node's `error`.
    pub async fn stop(&self, ids: Option<&[String]>) {
        self.runtime.events().emit(&RuntimeEvent::NodesStopping);
        let targets: Vec<String> = {
            let mut state = self.state.lock();
            let requested: Vec<String> = match ids {
                Some(list) => list.to_vec(),
                None => {
                    state.started = false;
                    self.active.iter().map(|e| e.key().clone()).collect()
                }
            };
            let mut targets = Vec::with_capacity(requested.len());
            for id in requested {
                match state.instances.remove(&id) {
                    Some(instance) => targets.extend(instance.members()),
                    None => targets.push(id),
                }
            }
            if ids.is_none() {
                state.instances.clear();
            }
            targets
        };

        let mut pending = Vec::new();
        let mut stopped = 0;
        for id in targets {
            let Some((_, node)) = self.active.remove(&id) else {
                continue;
            };
            self.runtime.remove_node(&id);
            self.handlers.write().retain(|h| h.node.id() != id);
            stopped += 1;
            match node.close() {
                Closing::Done(Ok(())) => {}
                Closing::Done(Err(e)) => node.error(e, None),
                Closing::Pending(done) => pending.push(async move {
                    if let Err(e) = done.await {
                        node.error(e, None);
                    }
                }),
            }
        }
        join_all(pending).await;

        debug!(flow = %self.id, stopped, "flow stopped");
        self.runtime.events().emit(&RuntimeEvent::NodesStopped);
    }

    /// Clears `type_name` from the missing set and starts the flow once
    /// nothing is missing, provided a start was already requested.
    pub fn type_registered(&self, type_name: &str) {
        let ready = {
            let mut state = self.state.lock();
            let before = state.missing_types.len();
            state.missing_types.retain(|t| t != type_name);
            before > state.missing_types.len() && state.missing_types.is_empty() && state.started
        };
        if ready {
            info!(flow = %self.id, "missing types registered, starting flow");
            if let Err(e) = self.start(None) {
                warn!(flow = %self.id, "flow start failed: {e}");
            }
        }
    }

    fn create_node(&self, desc: &NodeDescriptor) -> Option<Arc<Node>> {
        let factory = match self.runtime.registry().lookup(&desc.type_name) {
            TypeLookup::Available(factory) => factory,
            other => {
                warn!(flow = %self.id, node = %desc.id, kind = %desc.type_name, "node type not usable: {other:?}");
                return None;
            }
        };
        let mut config = desc.clone();
        config.credentials = None;
        config.props.values_mut().for_each(map_env_vars);
        let credentials = self.runtime.credentials().get(config.credential_key());
        let node = Node::new(&config, credentials, Arc::downgrade(&self.runtime));

        match panic::catch_unwind(AssertUnwindSafe(|| factory.create(&node, &config))) {
            Ok(Ok(behavior)) => node.set_behavior(behavior),
            Ok(Err(e)) => {
                warn!(flow = %self.id, node = %desc.id, kind = %desc.type_name, "node not created: {e}");
                return None;
            }
            Err(p) => {
                warn!(flow = %self.id, node = %desc.id, kind = %desc.type_name, "node constructor panicked: {}", panic_message(p.as_ref()));
                return None;
            }
        }

        let kind = match config.type_name.as_str() {
            CATCH_TYPE => Some(HandlerKind::Catch),
            STATUS_TYPE => Some(HandlerKind::Status),
            _ => None,
        };
        if let Some(kind) = kind {
            let scope = config
                .prop("scope")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect());
            self.handlers.write().push(Handler { kind, node: node.clone(), scope });
        }
        self.track(node.clone());
        Some(node)
    }

    fn track(&self, node: Arc<Node>) {
        self.runtime.insert_node(node.clone());
        self.runtime.index_node(node.id(), &self.id);
        self.active.insert(node.id().to_string(), node);
    }

    fn handlers_in(&self, kind: HandlerKind, z: &str, reporter: &str) -> Vec<Arc<Node>> {
        self.handlers
            .read()
            .iter()
            .filter(|h| h.kind == kind && h.node.z() == Some(z))
            .filter(|h| h.scope.as_ref().is_none_or(|s| s.iter().any(|id| id == reporter)))
            .map(|h| h.node.clone())
            .collect()
    }

    /// Finds the handlers nearest to `node`: those sharing its `z`, else
    /// those around the subflow instance containing it, and so on outward.
    fn nearest_handlers(&self, kind: HandlerKind, node: &Node) -> Vec<Arc<Node>> {
        let mut reporter = node.id().to_string();
        let mut z = node.z().map(str::to_string);
        let mut visited = HashSet::new();
        while let Some(scope) = z {
            if !visited.insert(scope.clone()) {
                break;
            }
            let subject = match kind {
                HandlerKind::Catch => reporter.as_str(),
                HandlerKind::Status => node.id(),
            };
            let found = self.handlers_in(kind, &scope, subject);
            if !found.is_empty() {
                return found;
            }
            let Some(router) = self.runtime.node(&scope) else {
                break;
            };
            reporter = router.id().to_string();
            z = router.z().map(str::to_string);
        }
        Vec::new()
    }

    /// Hands a node error to the nearest catch nodes. Returns whether any
    /// received it.
    pub fn handle_error(&self, node: &Node, text: &str, msg: Option<&Message>) -> bool {
        let mut count = 1;
        let prior_source = msg.and_then(|m| m.get("error")).and_then(|e| e.get("source"));
        if let Some(source) = prior_source {
            if source.get("id").and_then(Value::as_str) == Some(node.id()) {
                count = source.get("count").and_then(Value::as_u64).unwrap_or(0) + 1;
                if count >= MAX_CATCH_COUNT {
                    warn!(node = %node.id(), "message exceeded maximum number of catches");
                    return false;
                }
            }
        }

        let targets = self.nearest_handlers(HandlerKind::Catch, node);
        if targets.is_empty() {
            return false;
        }
        let mut report = msg.cloned().unwrap_or_default();
        if let Some(prior) = report.remove("error") {
            report.set("_error", prior);
        }
        report.set(
            "error",
            json!({
                "message": text,
                "source": {
                    "id": node.id(),
                    "type": node.type_name(),
                    "name": node.name(),
                    "count": count,
                },
            }),
        );
        deliver(targets, report);
        true
    }

    /// Hands a status change to the nearest status nodes.
    pub fn handle_status(&self, node: &Node, status: &NodeStatus) -> bool {
        let targets = self.nearest_handlers(HandlerKind::Status, node);
        if targets.is_empty() {
            return false;
        }
        let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut body {
            let mut source = serde_json::Map::new();
            source.insert("id".into(), json!(node.id()));
            source.insert("type".into(), json!(node.type_name()));
            if let Some(name) = node.name() {
                source.insert("name".into(), json!(name));
            }
            map.insert("source".into(), Value::Object(source));
        }
        let mut report = Message::new();
        report.set("status", body);
        deliver(targets, report);
        true
    }
}

/// The first handler gets `msg` itself, every other one a copy.
/// Drops the types the registry has gained since `types` was computed.
fn unresolved(runtime: &Runtime, mut types: Vec<String>) -> Vec<String> {
    types.retain(|t| !runtime.registry().is_available(t));
    types
}

fn deliver(targets: Vec<Arc<Node>>, msg: Message) {
    let copies: Vec<Message> = targets.iter().skip(1).map(|_| msg.clone()).collect();
    let mut targets = targets.into_iter();
    if let Some(first) = targets.next() {
        first.receive(msg);
    }
    for (target, copy) in targets.zip(copies) {
        target.receive(copy);
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.runtime.detach_flow(&self.id);
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("active", &self.active.len())
            .finish()
    }
}
