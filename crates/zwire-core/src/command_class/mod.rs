//! The command-class dispatcher boundary.
//!
//! Per-class value modelling lives outside the engine; what the engine needs
//! is a uniform capability set per instantiated class: identity, a handler
//! for inbound application commands that returns *typed events* (the driver
//! interprets them - no callbacks into the driver from inside a class), the
//! queries the class wants issued at each interrogation stage, and
//! serialisation for the network snapshot.

pub mod association;
pub mod basic;
pub mod wake_up;

use crate::node::QueryStage;
use crate::protocol::message::Message;

/// Typed outcome of feeding an inbound application command to a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassEvent {
    /// The node announced it is awake (WakeUp NOTIFICATION)
    WokeUp,
    /// The node reported its wake-up interval, in seconds
    IntervalReport(u32),
    /// A value modelled by this class changed
    ValueChanged {
        /// Reporting class
        class_id: u8,
        /// Value index within the class
        index: u8,
    },
    /// Association group membership was reported
    Group {
        /// Group index, 1-based
        group_id: u8,
    },
}

/// One instantiated command class on one node.
pub trait CommandClass: Send {
    /// The class id this handler dispatches on.
    fn class_id(&self) -> u8;

    /// Downcast support; the engine needs concrete access to WakeUp for the
    /// sleeping buffer.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Human name for logs.
    fn name(&self) -> &'static str;

    /// Feed an inbound application command (`data[0]` = command id, rest
    /// arguments). Returns the events the driver should act on.
    fn handle_incoming(&mut self, node_id: u8, data: &[u8]) -> Vec<ClassEvent>;

    /// Messages this class wants sent for the given interrogation stage.
    /// Classes with nothing to ask return an empty vec and the stage
    /// advances past them.
    fn request_state(&self, node_id: u8, stage: QueryStage) -> Vec<Message>;

    /// Persistent state for the snapshot. `Null` when the class is
    /// stateless.
    fn serialize(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Restore persistent state from a snapshot record.
    fn deserialize(&mut self, _state: &serde_json::Value) {}
}

/// Instantiate the handler for a class id advertised in a node's info
/// frame. Classes the engine does not model return `None` and are logged by
/// the caller.
pub fn create(class_id: u8) -> Option<Box<dyn CommandClass>> {
    match class_id {
        basic::CLASS_ID => Some(Box::new(basic::Basic::new())),
        wake_up::CLASS_ID => Some(Box::new(wake_up::WakeUp::new())),
        association::CLASS_ID => Some(Box::new(association::Association::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_modelled_classes() {
        assert_eq!(create(0x20).unwrap().class_id(), 0x20);
        assert_eq!(create(0x84).unwrap().class_id(), 0x84);
        assert_eq!(create(0x85).unwrap().class_id(), 0x85);
        assert!(create(0x26).is_none());
    }
}
