//! Node types the runtime itself relies on.

use std::sync::Arc;
use tracing::error;

use crate::descriptor::NodeDescriptor;
use crate::error::NodeError;
use crate::message::Message;
use crate::node::{Node, NodeBehavior, NodeType};
use crate::registry::{RegisterOptions, TypeRegistry};

#[cfg(test)]
pub(crate) mod testing;

pub const CATCH_TYPE: &str = "catch";
pub const STATUS_TYPE: &str = "status";

/// Forwards whatever the flow routes to it: error reports for `catch`,
/// status reports for `status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relay;

impl NodeBehavior for Relay {
    fn on_input(&self, node: &Node, msg: Message) -> Result<(), NodeError> {
        node.send(msg);
        Ok(())
    }
}

impl NodeType for Relay {
    fn create(&self, _node: &Arc<Node>, config: &NodeDescriptor) -> Result<Box<dyn NodeBehavior>, NodeError> {
        if let Some(scope) = config.prop("scope") {
            if !scope.is_null() && !scope.is_array() {
                return Err(NodeError::InvalidConfig(format!("scope must be a list of node ids, got {scope}")));
            }
        }
        Ok(Box::new(Relay))
    }
}

pub fn register_builtins(registry: &TypeRegistry) {
    for type_name in [CATCH_TYPE, STATUS_TYPE] {
        if let Err(e) = registry.register(type_name, Arc::new(Relay), RegisterOptions::module("core")) {
            error!("could not register built-in {type_name}: {e}");
        }
    }
}
