use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

use crate::descriptor::{NodeDescriptor, SubflowPort, subflow_ports};
use crate::registry::TypeRegistry;

/// Flow id of the implicit flow holding nodes without a tab.
pub const GLOBAL_FLOW_ID: &str = "_GLOBAL_";

/// A parsed subflow definition. Interior nodes are ordered with shared
/// config nodes first.
#[derive(Debug, Clone)]
pub struct SubflowTemplate {
    pub id: String,
    pub config: NodeDescriptor,
    pub nodes: Vec<NodeDescriptor>,
    pub inputs: Vec<SubflowPort>,
    pub outputs: Vec<SubflowPort>,
}

/// One deploy generation's descriptor list, partitioned.
#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    pub all_nodes: HashMap<String, NodeDescriptor>,
    /// Descriptor ids in input order.
    pub order: Vec<String>,
    pub tabs: Vec<String>,
    pub subflows: HashMap<String, Arc<SubflowTemplate>>,
    /// Nodes referenced from another node's properties.
    pub config_nodes: HashSet<String>,
    /// For each config node, the nodes referencing it.
    pub users: HashMap<String, Vec<String>>,
    pub missing_types: Vec<String>,
    scopes: HashMap<String, Vec<String>>,
}

impl FlowConfig {
    pub fn parse(descriptors: &[NodeDescriptor], registry: &TypeRegistry) -> Self {
        let mut config = FlowConfig::default();
        for node in descriptors {
            if config.all_nodes.insert(node.id.clone(), node.clone()).is_some() {
                warn!(node = %node.id, "duplicate node id; keeping the last definition");
                config.order.retain(|id| id != &node.id);
            }
            config.order.push(node.id.clone());
        }
        config.tabs = descriptors.iter().filter(|n| n.is_tab()).map(|n| n.id.clone()).collect();
        config.tabs.dedup();

        let mut config_nodes = HashSet::new();
        let mut users: HashMap<String, Vec<String>> = HashMap::new();
        for id in &config.order {
            let node = &config.all_nodes[id];
            for target in node.references() {
                let Some(referenced) = config.all_nodes.get(target) else {
                    continue;
                };
                if referenced.id == node.id || referenced.is_tab() || referenced.is_subflow_template() {
                    continue;
                }
                config_nodes.insert(referenced.id.clone());
                let list = users.entry(referenced.id.clone()).or_default();
                if !list.contains(&node.id) {
                    list.push(node.id.clone());
                }
            }
        }
        config.config_nodes = config_nodes;
        config.users = users;

        let template_ids: Vec<String> = config
            .order
            .iter()
            .filter(|id| config.all_nodes[*id].is_subflow_template())
            .cloned()
            .collect();
        let mut interiors: HashMap<String, Vec<String>> = HashMap::new();
        let mut scopes: HashMap<String, Vec<String>> = HashMap::new();
        scopes.insert(GLOBAL_FLOW_ID.to_string(), Vec::new());
        for tab in &config.tabs {
            scopes.insert(tab.clone(), Vec::new());
        }
        for id in &config.order {
            let node = &config.all_nodes[id];
            if node.is_tab() || node.is_subflow_template() {
                continue;
            }
            match node.z.as_deref() {
                None => scopes.entry(GLOBAL_FLOW_ID.to_string()).or_default().push(id.clone()),
                Some(z) if template_ids.iter().any(|t| t == z) => interiors.entry(z.to_string()).or_default().push(id.clone()),
                Some(z) => match scopes.get_mut(z) {
                    Some(scope) => scope.push(id.clone()),
                    None => warn!(node = %id, container = z, "node belongs to an unknown flow; skipped"),
                },
            }
        }
        for ids in scopes.values_mut() {
            config.configs_first(ids);
        }

        for template_id in template_ids {
            let template = config.all_nodes[&template_id].clone();
            let mut ids = interiors.remove(&template_id).unwrap_or_default();
            config.configs_first(&mut ids);
            let parsed = SubflowTemplate {
                nodes: ids.iter().map(|id| config.all_nodes[id].clone()).collect(),
                inputs: subflow_ports(&template, "in"),
                outputs: subflow_ports(&template, "out"),
                id: template_id.clone(),
                config: template,
            };
            config.subflows.insert(template_id, Arc::new(parsed));
        }
        config.scopes = scopes;

        let mut missing = Vec::new();
        for id in &config.order {
            let node = &config.all_nodes[id];
            if node.is_tab() || node.is_subflow_template() {
                continue;
            }
            let absent = match node.subflow_template_id() {
                Some(template) => !config.subflows.contains_key(template),
                None => !registry.is_available(&node.type_name),
            };
            if absent && !missing.contains(&node.type_name) {
                missing.push(node.type_name.clone());
            }
        }
        config.missing_types = missing;
        config
    }

    fn configs_first(&self, ids: &mut [String]) {
        ids.sort_by_key(|id| !self.config_nodes.contains(id));
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.all_nodes.get(id)
    }

    /// Flow ids in start order: the global flow, then tabs as declared.
    pub fn flow_ids(&self) -> Vec<String> {
        std::iter::once(GLOBAL_FLOW_ID.to_string()).chain(self.tabs.iter().cloned()).collect()
    }

    pub fn has_flow(&self, flow_id: &str) -> bool {
        self.scopes.contains_key(flow_id)
    }

    /// Nodes a flow instantiates directly, shared config nodes first.
    pub fn scope(&self, flow_id: &str) -> Vec<&NodeDescriptor> {
        self.scopes
            .get(flow_id)
            .map(|ids| ids.iter().filter_map(|id| self.all_nodes.get(id)).collect())
            .unwrap_or_default()
    }

    /// Template id when `id` is a node inside a subflow definition.
    pub fn interior_of(&self, id: &str) -> Option<&str> {
        let z = self.all_nodes.get(id)?.z.as_deref()?;
        self.subflows.contains_key(z).then_some(z)
    }

    /// The subset of `missing_types` a flow depends on, including types
    /// used inside the subflows it instantiates.
    pub fn missing_types_for(&self, flow_id: &str) -> Vec<String> {
        if self.missing_types.is_empty() {
            return Vec::new();
        }
        let mut used = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<&NodeDescriptor> = self.scope(flow_id);
        while let Some(node) = stack.pop() {
            used.insert(node.type_name.as_str());
            if let Some(template) = node.subflow_template_id().and_then(|t| self.subflows.get(t)) {
                if visited.insert(template.id.as_str()) {
                    stack.extend(template.nodes.iter());
                }
            }
        }
        self.missing_types
            .iter()
            .filter(|t| used.contains(t.as_str()))
            .cloned()
            .collect()
    }

    /// Removes secrets so the parsed generation can be kept around.
    pub fn strip_credentials(&mut self) {
        for node in self.all_nodes.values_mut() {
            node.credentials = None;
        }
        for template in self.subflows.values_mut() {
            let template = Arc::make_mut(template);
            for node in &mut template.nodes {
                node.credentials = None;
            }
        }
    }

    /// Descriptors in input order.
    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.order.iter().filter_map(|id| self.all_nodes.get(id).cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::TestBed;
    use serde_json::json;

    fn nodes() -> Vec<NodeDescriptor> {
        vec![
            NodeDescriptor::new("t1", "tab"),
            NodeDescriptor::new("cfg", "config"),
            NodeDescriptor::new("a", "rec").with_z("t1").with_wires([["b"]]),
            NodeDescriptor::new("b", "rec").with_z("t1").with_prop("server", json!("cfg")),
            NodeDescriptor::new("local", "config").with_z("t1"),
            NodeDescriptor::new("c", "rec").with_z("t1").with_prop("conn", json!("local")),
            NodeDescriptor::new("sf", "subflow").with_prop("in", json!([{"wires": [{"id": "i1"}]}])),
            NodeDescriptor::new("i1", "rec").with_z("sf"),
            NodeDescriptor::new("u1", "subflow:sf").with_z("t1"),
            NodeDescriptor::new("stray", "rec").with_z("nowhere"),
        ]
    }

    #[test]
    fn partitions_scopes_and_templates() {
        let bed = TestBed::new();
        let config = FlowConfig::parse(&nodes(), bed.runtime.registry());

        assert_eq!(config.flow_ids(), vec![GLOBAL_FLOW_ID, "t1"]);
        let global: Vec<_> = config.scope(GLOBAL_FLOW_ID).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(global, vec!["cfg"]);
        let tab: Vec<_> = config.scope("t1").iter().map(|n| n.id.as_str()).collect();
        assert_eq!(tab, vec!["local", "a", "b", "c", "u1"]);

        let sf = &config.subflows["sf"];
        assert_eq!(sf.nodes.len(), 1);
        assert_eq!(sf.inputs[0].wires[0].id, "i1");
        assert_eq!(config.interior_of("i1"), Some("sf"));
        assert_eq!(config.interior_of("a"), None);

        assert!(config.config_nodes.contains("cfg"));
        assert_eq!(config.users["cfg"], vec!["b"]);
        assert!(config.missing_types.is_empty());
    }

    #[test]
    fn missing_types_are_per_flow() {
        let bed = TestBed::new();
        let mut list = nodes();
        list.push(NodeDescriptor::new("t2", "tab"));
        list.push(NodeDescriptor::new("m", "mqtt in").with_z("t2"));
        list.push(NodeDescriptor::new("i2", "smtp").with_z("sf"));
        list.push(NodeDescriptor::new("u9", "subflow:gone").with_z("t2"));
        let config = FlowConfig::parse(&list, bed.runtime.registry());

        assert_eq!(config.missing_types, vec!["mqtt in", "smtp", "subflow:gone"]);
        assert_eq!(config.missing_types_for("t1"), vec!["smtp"]);
        assert_eq!(config.missing_types_for("t2"), vec!["mqtt in", "subflow:gone"]);
        assert!(config.missing_types_for(GLOBAL_FLOW_ID).is_empty());
    }

    #[test]
    fn strip_credentials_clears_templates_too() {
        let bed = TestBed::new();
        let secret = json!({"k": "v"}).as_object().cloned().unwrap();
        let list = vec![
            NodeDescriptor::new("sf", "subflow"),
            NodeDescriptor::new("i1", "rec").with_z("sf").with_credentials(secret.clone()),
            NodeDescriptor::new("g", "config").with_credentials(secret),
        ];
        let mut config = FlowConfig::parse(&list, bed.runtime.registry());
        config.strip_credentials();
        assert!(config.descriptors().iter().all(|n| n.credentials.is_none()));
        assert!(config.subflows["sf"].nodes[0].credentials.is_none());
    }
}
