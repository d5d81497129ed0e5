//! COMMAND_CLASS_BASIC.
//!
//! The lowest common denominator every device speaks: one byte of state.
//! The engine models it so the poller and the dynamic interrogation stage
//! have something real to refresh; richer classes live outside the core.

use serde::{Deserialize, Serialize};

use crate::command_class::{ClassEvent, CommandClass};
use crate::node::QueryStage;
use crate::protocol::message::{send_data, Message};

/// COMMAND_CLASS_BASIC
pub const CLASS_ID: u8 = 0x20;

/// Set the device's basic value
pub const SET: u8 = 0x01;
/// Ask for the basic value
pub const GET: u8 = 0x02;
/// Value answer (and unsolicited state change on many devices)
pub const REPORT: u8 = 0x03;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    value: u8,
}

/// Basic handler state for one node.
#[derive(Debug, Default)]
pub struct Basic {
    value: u8,
}

impl Basic {
    /// New handler with value 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// A BASIC_GET requesting a fresh report.
    pub fn request_value(node_id: u8) -> Message {
        let mut msg = send_data("basic get", node_id, CLASS_ID, GET, &[]);
        msg.expect_command_class_reply(CLASS_ID);
        msg
    }

    /// A BASIC_SET writing `value` (0x00 = off, 0xff = on, 1..=99 = level).
    pub fn set_value(node_id: u8, value: u8) -> Message {
        send_data("basic set", node_id, CLASS_ID, SET, &[value])
    }
}

impl CommandClass for Basic {
    fn class_id(&self) -> u8 {
        CLASS_ID
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_BASIC"
    }

    fn handle_incoming(&mut self, node_id: u8, data: &[u8]) -> Vec<ClassEvent> {
        match data.first() {
            Some(&REPORT) | Some(&SET) if data.len() >= 2 => {
                // Some devices report state changes as BASIC_SET to the
                // controller; treat both as a report.
                self.value = data[1];
                tracing::debug!(node_id, value = self.value, "basic report");
                vec![ClassEvent::ValueChanged {
                    class_id: CLASS_ID,
                    index: 0,
                }]
            }
            _ => {
                tracing::debug!(node_id, ?data, "unhandled basic command");
                Vec::new()
            }
        }
    }

    fn request_state(&self, node_id: u8, stage: QueryStage) -> Vec<Message> {
        match stage {
            QueryStage::Dynamic => vec![Self::request_value(node_id)],
            _ => Vec::new(),
        }
    }

    fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(PersistedState { value: self.value })
            .unwrap_or(serde_json::Value::Null)
    }

    fn deserialize(&mut self, state: &serde_json::Value) {
        if let Ok(state) = serde_json::from_value::<PersistedState>(state.clone()) {
            self.value = state.value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_updates_value_and_emits_change() {
        let mut basic = Basic::new();
        let events = basic.handle_incoming(4, &[REPORT, 0xff]);
        assert_eq!(events, vec![ClassEvent::ValueChanged { class_id: CLASS_ID, index: 0 }]);
        assert_eq!(basic.value(), 0xff);
    }

    #[test]
    fn dynamic_stage_requests_the_value() {
        let basic = Basic::new();
        assert_eq!(basic.request_state(4, QueryStage::Dynamic).len(), 1);
        assert!(basic.request_state(4, QueryStage::Static).is_empty());
    }
}
