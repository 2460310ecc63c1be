use petgraph::graphmap::UnGraphMap;
use std::collections::BTreeSet;
use tracing::debug;

use super::config::FlowConfig;
use crate::util::same_wires;

/// What a redeploy touches, by node id.
///
/// Nodes interior to a subflow template never appear here; edits inside a
/// template surface as the template id plus every usage site in `changed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowDiff {
    pub added: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
    pub linked: BTreeSet<String>,
    pub wiring_changed: BTreeSet<String>,
}

impl FlowDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.deleted.is_empty()
            && self.linked.is_empty()
            && self.wiring_changed.is_empty()
    }

    /// Nodes a `nodes` deploy stops and recreates.
    pub fn restart_set(&self) -> BTreeSet<String> {
        self.changed.union(&self.deleted).cloned().collect()
    }

    /// Nodes a `flows` deploy stops and recreates.
    pub fn restart_set_with_linked(&self) -> BTreeSet<String> {
        let mut set = self.restart_set();
        set.extend(self.linked.iter().cloned());
        set
    }
}

fn is_interior(old: &FlowConfig, new: &FlowConfig, id: &str) -> bool {
    new.interior_of(id).is_some() || old.interior_of(id).is_some()
}

pub fn diff_configs(old: &FlowConfig, new: &FlowConfig) -> FlowDiff {
    let mut added = BTreeSet::new();
    let mut changed = BTreeSet::new();
    let mut wiring = BTreeSet::new();

    for id in &new.order {
        let node = &new.all_nodes[id];
        match old.node(id) {
            None => {
                added.insert(id.clone());
                changed.insert(id.clone());
            }
            Some(prior) => {
                if prior.properties_differ(node) || node.credentials.is_some() {
                    changed.insert(id.clone());
                }
                if !same_wires(&prior.wires, &node.wires) {
                    wiring.insert(id.clone());
                }
            }
        }
    }
    let removed: BTreeSet<String> = old
        .order
        .iter()
        .filter(|id| new.node(id).is_none())
        .cloned()
        .collect();

    // Any edit inside a template dirties the template itself.
    let dirty: Vec<String> = changed
        .iter()
        .chain(wiring.iter())
        .filter_map(|id| new.interior_of(id))
        .map(str::to_string)
        .collect();
    changed.extend(dirty);
    for id in &removed {
        if let Some(template) = old.interior_of(id) {
            if new.subflows.contains_key(template) {
                changed.insert(template.to_string());
            }
        }
    }

    // Config references and subflow usage sites, until nothing moves.
    loop {
        let mut grew = false;
        for id in &new.order {
            if changed.contains(id) {
                continue;
            }
            let node = &new.all_nodes[id];
            let stale_reference = node
                .references()
                .any(|r| r != id && (changed.contains(r) || removed.contains(r)));
            let stale_template = node.subflow_template_id().is_some_and(|t| changed.contains(t));
            if stale_reference || stale_template {
                changed.insert(id.clone());
                if let Some(template) = new.interior_of(id) {
                    changed.insert(template.to_string());
                }
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    let is_tab = |id: &str| {
        new.node(id).or_else(|| old.node(id)).is_some_and(|n| n.is_tab())
    };
    changed.retain(|id| !is_interior(old, new, id) && !is_tab(id));
    added.retain(|id| !is_interior(old, new, id) && !is_tab(id));
    wiring.retain(|id| !is_interior(old, new, id));
    let deleted: BTreeSet<String> = removed
        .into_iter()
        .filter(|id| old.interior_of(id).is_none() && !is_tab(id))
        .collect();

    let mut graph: UnGraphMap<&str, ()> = UnGraphMap::new();
    for config in [old, new] {
        for (id, node) in &config.all_nodes {
            if is_interior(old, new, id) {
                continue;
            }
            for target in node.wires.iter().flatten() {
                if old.node(target).is_some() || new.node(target).is_some() {
                    graph.add_edge(id.as_str(), target.as_str(), ());
                }
            }
        }
    }
    let mut linked: BTreeSet<String> = wiring.clone();
    for seed in changed.iter().chain(deleted.iter()).chain(wiring.iter()) {
        linked.extend(graph.neighbors(seed.as_str()).map(str::to_string));
    }
    linked.retain(|id| {
        !changed.contains(id)
            && !deleted.contains(id)
            && !is_interior(old, new, id)
            && !is_tab(id)
            && !new.subflows.contains_key(id)
            && !old.subflows.contains_key(id)
    });

    let diff = FlowDiff { added, changed, deleted, linked, wiring_changed: wiring };
    debug!(
        changed = diff.changed.len(),
        deleted = diff.deleted.len(),
        linked = diff.linked.len(),
        wiring = diff.wiring_changed.len(),
        "computed deploy diff"
    );
    diff
}
