//! COMMAND_CLASS_ASSOCIATION.
//!
//! Group membership: which nodes a device notifies of its events. The engine
//! refreshes groups during the Associations interrogation stage and surfaces
//! membership changes as Group notifications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command_class::{ClassEvent, CommandClass};
use crate::node::QueryStage;
use crate::protocol::message::{send_data, Message};

/// COMMAND_CLASS_ASSOCIATION
pub const CLASS_ID: u8 = 0x85;

/// Add members to a group
pub const SET: u8 = 0x01;
/// Ask for a group's members
pub const GET: u8 = 0x02;
/// Group membership answer
pub const REPORT: u8 = 0x03;
/// Remove members from a group
pub const REMOVE: u8 = 0x04;
/// Ask how many groups the device supports
pub const GROUPINGS_GET: u8 = 0x05;
/// Group count answer
pub const GROUPINGS_REPORT: u8 = 0x06;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    groups: BTreeMap<u8, Vec<u8>>,
}

/// Association handler state for one node.
#[derive(Debug, Default)]
pub struct Association {
    num_groups: u8,
    groups: BTreeMap<u8, Vec<u8>>,
}

impl Association {
    /// New handler with no known groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a group, if reported.
    pub fn group(&self, group_id: u8) -> Option<&[u8]> {
        self.groups.get(&group_id).map(Vec::as_slice)
    }

    /// Reported group count (0 = not yet queried).
    pub fn num_groups(&self) -> u8 {
        self.num_groups
    }
}

impl CommandClass for Association {
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
        "COMMAND_CLASS_ASSOCIATION"
    }

    fn handle_incoming(&mut self, node_id: u8, data: &[u8]) -> Vec<ClassEvent> {
        match data.first() {
            Some(&GROUPINGS_REPORT) if data.len() >= 2 => {
                self.num_groups = data[1];
                tracing::debug!(node_id, groups = self.num_groups, "association groupings report");
                Vec::new()
            }
            Some(&REPORT) if data.len() >= 4 => {
                // command, group, max members, reports-to-follow, members...
                let group_id = data[1];
                let members = data[4..].to_vec();
                self.groups.insert(group_id, members);
                tracing::debug!(node_id, group_id, "association report");
                vec![ClassEvent::Group { group_id }]
            }
            _ => {
                tracing::debug!(node_id, ?data, "unhandled association command");
                Vec::new()
            }
        }
    }

    fn request_state(&self, node_id: u8, stage: QueryStage) -> Vec<Message> {
        match stage {
            QueryStage::Associations => {
                let mut msg = send_data("association groupings get", node_id, CLASS_ID, GROUPINGS_GET, &[]);
                msg.expect_command_class_reply(CLASS_ID);
                vec![msg]
            }
            _ => Vec::new(),
        }
    }

    fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(PersistedState {
            groups: self.groups.clone(),
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn deserialize(&mut self, state: &serde_json::Value) {
        if let Ok(state) = serde_json::from_value::<PersistedState>(state.clone()) {
            self.groups = state.groups;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_stores_members_and_emits_group_event() {
        let mut assoc = Association::new();
        let events = assoc.handle_incoming(3, &[REPORT, 1, 5, 0, 0x01, 0x0a]);
        assert_eq!(events, vec![ClassEvent::Group { group_id: 1 }]);
        assert_eq!(assoc.group(1), Some(&[0x01, 0x0a][..]));
    }

    #[test]
    fn groupings_report_sets_count() {
        let mut assoc = Association::new();
        assert!(assoc.handle_incoming(3, &[GROUPINGS_REPORT, 4]).is_empty());
        assert_eq!(assoc.num_groups(), 4);
    }
}
