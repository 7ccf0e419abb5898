pub mod parser;
pub mod tree;

pub use parser::{parse_topology_config, SwitchChildren, SwitchDef, TopologyConfig};
pub use tree::Topology;
