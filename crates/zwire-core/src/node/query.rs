//! The per-node interrogation pipeline.
//!
//! Every node advances monotonically through the stages below. A stage
//! issues the messages it needs, then a `QueryStageComplete` marker trails
//! them through the Query queue; when the scheduler pops the marker the
//! stage commits and the next one starts. Retries re-run the same stage,
//! never skip.

use serde::{Deserialize, Serialize};

/// Interrogation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryStage {
    /// Capabilities and device-class bytes held by the controller
    ProtocolInfo,
    /// A NO_OPERATION ping proving the node is reachable
    Probe,
    /// The node's supported command classes
    NodeInfo,
    /// Manufacturer and product identity
    ManufacturerSpecific,
    /// Command-class versions
    Versions,
    /// Multi-instance discovery
    Instances,
    /// Static, never-changing class state
    Static,
    /// Association group membership
    Associations,
    /// Neighbour table held by the controller
    Neighbours,
    /// Session state that survives only while the device is up
    Session,
    /// Frequently changing values
    Dynamic,
    /// Device configuration parameters
    Configuration,
    /// Interrogation finished
    Complete,
}

impl QueryStage {
    /// The stage after this one; `Complete` is terminal.
    pub fn next(self) -> QueryStage {
        use QueryStage::*;
        match self {
            ProtocolInfo => Probe,
            Probe => NodeInfo,
            NodeInfo => ManufacturerSpecific,
            ManufacturerSpecific => Versions,
            Versions => Instances,
            Instances => Static,
            Static => Associations,
            Associations => Neighbours,
            Neighbours => Session,
            Session => Dynamic,
            Dynamic => Configuration,
            Configuration => Complete,
            Complete => Complete,
        }
    }

    /// Whether exhausting the retry budget at this stage abandons the whole
    /// interrogation (the node is unreachable) rather than skipping one
    /// stage.
    pub fn failure_is_fatal(self) -> bool {
        matches!(
            self,
            QueryStage::ProtocolInfo | QueryStage::Probe | QueryStage::NodeInfo
        )
    }

    /// Stage name for logs.
    pub fn name(self) -> &'static str {
        match self {
            QueryStage::ProtocolInfo => "ProtocolInfo",
            QueryStage::Probe => "Probe",
            QueryStage::NodeInfo => "NodeInfo",
            QueryStage::ManufacturerSpecific => "ManufacturerSpecific",
            QueryStage::Versions => "Versions",
            QueryStage::Instances => "Instances",
            QueryStage::Static => "Static",
            QueryStage::Associations => "Associations",
            QueryStage::Neighbours => "Neighbours",
            QueryStage::Session => "Session",
            QueryStage::Dynamic => "Dynamic",
            QueryStage::Configuration => "Configuration",
            QueryStage::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
