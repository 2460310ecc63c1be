//! A flow-based message routing runtime: node types register with a
//! registry, deploys describe wired node graphs, and the flow manager keeps
//! the running graph in line with the latest deploy.

pub mod comms;
pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod util;

pub use descriptor::NodeDescriptor;
pub use error::{FlowError, NodeError};
pub use flow::{DeployMode, FlowManager};
pub use message::Message;
pub use node::{Node, NodeBehavior, NodeStatus, NodeType, Outgoing};
pub use runtime::Runtime;
