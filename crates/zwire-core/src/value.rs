//! Value identity.

use serde::{Deserialize, Serialize};

/// Identifies one reportable value on the network: a command class instance
/// index on a node. Values are modelled by the command classes themselves;
/// the engine only routes and polls them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId {
    /// Network the value belongs to
    pub home_id: u32,
    /// Owning node
    pub node_id: u8,
    /// Command class that models the value
    pub class_id: u8,
    /// Class instance (multi-instance devices), 1-based
    pub instance: u8,
    /// Value index within the instance
    pub index: u8,
}

impl ValueId {
    /// Construct a value id for instance 1, index 0 of a class - the common
    /// single-instance case.
    pub fn new(home_id: u32, node_id: u8, class_id: u8) -> Self {
        Self {
            home_id,
            node_id,
            class_id,
            instance: 1,
            index: 0,
        }
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:08x}/node{:03}/cc0x{:02x}/i{}/v{}",
            self.home_id, self.node_id, self.class_id, self.instance, self.index
        )
    }
}
