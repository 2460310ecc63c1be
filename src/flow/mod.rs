//! Deploy generations: parsing, diffing and the live flows built from them.

pub mod active;
pub mod config;
pub mod diff;
pub mod manager;
pub mod subflow;


pub use active::Flow;
pub use config::{FlowConfig, GLOBAL_FLOW_ID, SubflowTemplate};
pub use diff::{FlowDiff, diff_configs};
pub use manager::{DeployMode, FlowManager};
pub use subflow::SubflowInstance;
