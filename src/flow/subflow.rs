use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::config::{FlowConfig, SubflowTemplate};
use crate::descriptor::NodeDescriptor;
use crate::error::{FlowError, NodeError};
use crate::message::Message;
use crate::node::{Node, NodeBehavior};
use crate::runtime::Runtime;
use crate::util::{generate_id, same_wires};

/// Props holding lists of node ids that must follow the id remapping.
const SCOPE_KEY: &str = "scope";

/// Stands in for the usage node: receives what is wired to the instance and
/// hands it to the nodes behind the template's input port.
struct SubflowInput;

impl NodeBehavior for SubflowInput {
    fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        node.send(msg);
        Ok(())
    }
}

/// One live copy of a subflow template.
pub struct SubflowInstance {
    usage: NodeDescriptor,
    template: Arc<SubflowTemplate>,
    router: Arc<Node>,
    /// Template node id to the id of its copy in this instance.
    id_map: HashMap<String, String>,
    /// Copies with remapped ids and their own interior wiring only.
    base: Vec<NodeDescriptor>,
    /// Wiring currently applied to each copy, output splices included.
    applied: HashMap<String, Vec<Vec<String>>>,
    nodes: HashMap<String, Arc<Node>>,
    nested: HashMap<String, SubflowInstance>,
}

impl SubflowInstance {
    /// Clones the template behind `usage`, creating each interior node with
    /// `create`. Nested usages become nested instances. The router taking the
    /// usage node's place is returned in [`SubflowInstance::router`]; callers
    /// index it themselves.
    pub fn build(
        usage: &NodeDescriptor,
        config: &FlowConfig,
        runtime: &Arc<Runtime>,
        create: &mut dyn FnMut(&NodeDescriptor) -> Option<Arc<Node>>,
    ) -> Result<Self, FlowError> {
        Self::build_nested(usage, config, runtime, create, &mut Vec::new())
    }

    fn build_nested(
        usage: &NodeDescriptor,
        config: &FlowConfig,
        runtime: &Arc<Runtime>,
        create: &mut dyn FnMut(&NodeDescriptor) -> Option<Arc<Node>>,
        stack: &mut Vec<String>,
    ) -> Result<Self, FlowError> {
        let template_id = usage.subflow_template_id().unwrap_or_default();
        let template = config
            .subflows
            .get(template_id)
            .cloned()
            .ok_or_else(|| FlowError::MissingTypes(vec![usage.type_name.clone()]))?;
        if stack.iter().any(|t| t == template_id) {
            return Err(FlowError::RecursiveSubflow(template_id.to_string()));
        }
        stack.push(template_id.to_string());

        let (base, id_map) = clone_interior(&template, usage);
        let (router_wires, applied) = splice(&base, &template, &id_map, &usage.wires);

        let mut router_desc = usage.clone();
        router_desc.wires = router_wires;
        router_desc.credentials = None;
        let router = Node::new(&router_desc, None, Arc::downgrade(runtime));
        router.set_behavior(Box::new(SubflowInput));

        let mut nodes = HashMap::new();
        let mut nested = HashMap::new();
        for node in &base {
            let mut wired = node.clone();
            if let Some(wires) = applied.get(&node.id) {
                wired.wires = wires.clone();
            }
            if wired.subflow_template_id().is_some() {
                match Self::build_nested(&wired, config, runtime, create, stack) {
                    Ok(inner) => {
                        nested.insert(wired.id.clone(), inner);
                    }
                    Err(e) => warn!(node = %wired.id, subflow = %template.id, "nested subflow not started: {e}"),
                }
            } else if let Some(live) = create(&wired) {
                nodes.insert(wired.id.clone(), live);
            }
        }
        stack.pop();
        debug!(usage = %usage.id, subflow = %template.id, nodes = nodes.len(), "subflow instance created");

        Ok(Self { usage: usage.clone(), template, router, id_map, base, applied, nodes, nested })
    }

    pub fn id(&self) -> &str {
        &self.usage.id
    }

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn router(&self) -> &Arc<Node> {
        &self.router
    }

    /// Nested instances' routers, in no particular order.
    pub fn nested_routers(&self) -> Vec<Arc<Node>> {
        self.nested
            .values()
            .flat_map(|n| std::iter::once(n.router.clone()).chain(n.nested_routers()))
            .collect()
    }

    /// Every live node id this instance owns, router first.
    pub fn members(&self) -> Vec<String> {
        let mut ids = vec![self.usage.id.clone()];
        ids.extend(self.base.iter().map(|n| n.id.clone()));
        for inner in self.nested.values() {
            ids.extend(inner.members().into_iter().skip(1));
        }
        ids
    }

    /// Id of the copy of template node `template_node_id`.
    pub fn copy_of(&self, template_node_id: &str) -> Option<&str> {
        self.id_map.get(template_node_id).map(String::as_str)
    }

    /// Re-splices the output ports onto new usage wiring without recreating
    /// any interior node.
    pub fn update_wires(&mut self, wires: Vec<Vec<String>>) {
        self.usage.wires = wires;
        let (router_wires, applied) = splice(&self.base, &self.template, &self.id_map, &self.usage.wires);
        for (id, new_wires) in &applied {
            let unchanged = self.applied.get(id).is_some_and(|old| same_wires(old, new_wires));
            if unchanged {
                continue;
            }
            if let Some(inner) = self.nested.get_mut(id) {
                inner.update_wires(new_wires.clone());
            } else if let Some(node) = self.nodes.get(id) {
                node.update_wires(new_wires.clone());
            }
        }
        self.router.update_wires(router_wires);
        self.applied = applied;
    }
}

impl std::fmt::Debug for SubflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubflowInstance")
            .field("id", &self.usage.id)
            .field("template", &self.template.id)
            .field("nodes", &self.nodes.len())
            .field("nested", &self.nested.len())
            .finish()
    }
}

/// Copies every template node under a fresh id, owned by the usage node.
/// Wires and id-valued properties are rewritten to point at the copies.
fn clone_interior(template: &SubflowTemplate, usage: &NodeDescriptor) -> (Vec<NodeDescriptor>, HashMap<String, String>) {
    let id_map: HashMap<String, String> = template
        .nodes
        .iter()
        .map(|n| (n.id.clone(), generate_id()))
        .collect();
    let remap = |id: &str| id_map.get(id).cloned().unwrap_or_else(|| id.to_string());

    let copies = template
        .nodes
        .iter()
        .map(|original| {
            let mut copy = original.clone();
            copy.id = remap(&original.id);
            copy.alias = Some(original.alias.clone().unwrap_or_else(|| original.id.clone()));
            copy.z = Some(usage.id.clone());
            copy.wires = original
                .wires
                .iter()
                .map(|port| port.iter().map(|t| remap(t)).collect())
                .collect();
            for (key, value) in copy.props.iter_mut() {
                match value {
                    Value::String(s) if id_map.contains_key(s.as_str()) => {
                        let fresh = remap(s);
                        *s = fresh;
                    }
                    Value::Array(items) if key == SCOPE_KEY => {
                        for item in items.iter_mut() {
                            if let Value::String(s) = item {
                                let fresh = remap(s);
                                *s = fresh;
                            }
                        }
                    }
                    _ => {}
                }
            }
            copy
        })
        .collect();
    (copies, id_map)
}

/// Connects the template's output ports to the usage node's wires.
///
/// Returns the router's wiring and the resulting wiring of every copy.
/// An output wired straight from the template input passes through the
/// router itself.
fn splice(
    base: &[NodeDescriptor],
    template: &SubflowTemplate,
    id_map: &HashMap<String, String>,
    usage_wires: &[Vec<String>],
) -> (Vec<Vec<String>>, HashMap<String, Vec<Vec<String>>>) {
    let mut applied: HashMap<String, Vec<Vec<String>>> =
        base.iter().map(|n| (n.id.clone(), n.wires.clone())).collect();

    let mut router: Vec<Vec<String>> = template
        .inputs
        .iter()
        .map(|input| {
            input
                .wires
                .iter()
                .filter_map(|w| id_map.get(&w.id).cloned())
                .collect()
        })
        .collect();

    for (index, output) in template.outputs.iter().enumerate() {
        let Some(targets) = usage_wires.get(index) else {
            continue;
        };
        for wire in &output.wires {
            let port = if wire.id == template.id {
                &mut router
            } else {
                match id_map.get(&wire.id).and_then(|fresh| applied.get_mut(fresh)) {
                    Some(wires) => wires,
                    None => continue,
                }
            };
            if port.len() <= wire.port {
                port.resize_with(wire.port + 1, Vec::new);
            }
            port[wire.port].extend(targets.iter().cloned());
        }
    }
    (router, applied)
}
