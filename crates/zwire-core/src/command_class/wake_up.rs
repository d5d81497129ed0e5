//! COMMAND_CLASS_WAKE_UP.
//!
//! Non-listening devices receive only during their periodic check-in. This
//! class owns the node's sleeping buffer: items bound for the node while it
//! is believed asleep are parked here, and spliced onto the driver's WakeUp
//! queue when the device announces itself. The engine closes each check-in
//! with "No More Information" - that command itself is never parked (it
//! would re-arm forever).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::command_class::{ClassEvent, CommandClass};
use crate::node::QueryStage;
use crate::protocol::message::{send_data, Message};
use crate::queue::QueueItem;

/// COMMAND_CLASS_WAKE_UP
pub const CLASS_ID: u8 = 0x84;

/// Set the wake-up interval and report target
pub const INTERVAL_SET: u8 = 0x04;
/// Ask for the wake-up interval
pub const INTERVAL_GET: u8 = 0x05;
/// Interval answer
pub const INTERVAL_REPORT: u8 = 0x06;
/// Unsolicited "I am awake" announcement
pub const NOTIFICATION: u8 = 0x07;
/// Host is done; device may sleep again
pub const NO_MORE_INFORMATION: u8 = 0x08;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    interval_secs: u32,
}

/// WakeUp handler state for one node.
pub struct WakeUp {
    awake: bool,
    poll_required: bool,
    interval_secs: u32,
    pending: VecDeque<QueueItem>,
}

impl WakeUp {
    /// New handler; the device is assumed asleep until it says otherwise.
    pub fn new() -> Self {
        Self {
            awake: false,
            poll_required: false,
            interval_secs: 0,
            pending: VecDeque::new(),
        }
    }

    /// Whether the device is currently believed awake.
    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Update the awake belief (the driver calls this from wake delivery and
    /// from NO_ACK redirection).
    pub fn set_awake(&mut self, awake: bool) {
        if self.awake != awake {
            tracing::debug!(awake, "wake-up state changed");
        }
        self.awake = awake;
    }

    /// Park an item until the next check-in. "No More Information" is
    /// dropped instead, unconditionally.
    pub fn queue_item(&mut self, item: QueueItem) {
        if let QueueItem::Send(msg) = &item {
            if msg.is_wake_up_no_more_information() {
                tracing::debug!("dropping no-more-information for a sleeping node");
                return;
            }
        }
        self.pending.push_back(item);
    }

    /// Take every parked item, in the order it was parked.
    pub fn take_pending(&mut self) -> Vec<QueueItem> {
        self.pending.drain(..).collect()
    }

    /// Number of parked items.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flag that the poller wanted this node while it slept; the poll runs
    /// at the next check-in.
    pub fn set_poll_required(&mut self) {
        self.poll_required = true;
    }

    /// Clear and return the deferred-poll flag.
    pub fn take_poll_required(&mut self) -> bool {
        std::mem::take(&mut self.poll_required)
    }

    /// Last reported wake-up interval in seconds (0 = unknown).
    pub fn interval_secs(&self) -> u32 {
        self.interval_secs
    }

    /// The goodbye command closing a check-in.
    pub fn no_more_information(node_id: u8) -> Message {
        send_data("wake-up no more information", node_id, CLASS_ID, NO_MORE_INFORMATION, &[])
    }
}

impl Default for WakeUp {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandClass for WakeUp {
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
        "COMMAND_CLASS_WAKE_UP"
    }

    fn handle_incoming(&mut self, node_id: u8, data: &[u8]) -> Vec<ClassEvent> {
        match data.first() {
            Some(&NOTIFICATION) => {
                tracing::info!(node_id, "wake-up notification");
                self.awake = true;
                vec![ClassEvent::WokeUp]
            }
            Some(&INTERVAL_REPORT) if data.len() >= 4 => {
                let secs = u32::from(data[1]) << 16 | u32::from(data[2]) << 8 | u32::from(data[3]);
                self.interval_secs = secs;
                tracing::debug!(node_id, secs, "wake-up interval report");
                vec![ClassEvent::IntervalReport(secs)]
            }
            _ => {
                tracing::debug!(node_id, ?data, "unhandled wake-up command");
                Vec::new()
            }
        }
    }

    fn request_state(&self, node_id: u8, stage: QueryStage) -> Vec<Message> {
        match stage {
            QueryStage::Session => {
                let mut msg = send_data("wake-up interval get", node_id, CLASS_ID, INTERVAL_GET, &[]);
                msg.expect_command_class_reply(CLASS_ID);
                vec![msg]
            }
            _ => Vec::new(),
        }
    }

    fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(PersistedState {
            interval_secs: self.interval_secs,
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn deserialize(&mut self, state: &serde_json::Value) {
        if let Ok(state) = serde_json::from_value::<PersistedState>(state.clone()) {
            self.interval_secs = state.interval_secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::REQUEST;

    #[test]
    fn notification_marks_awake() {
        let mut wake_up = WakeUp::new();
        assert!(!wake_up.is_awake());
        let events = wake_up.handle_incoming(7, &[NOTIFICATION]);
        assert_eq!(events, vec![ClassEvent::WokeUp]);
        assert!(wake_up.is_awake());
    }

    #[test]
    fn interval_report_round_trips_through_snapshot_state() {
        let mut wake_up = WakeUp::new();
        // 0x000e10 = 3600 seconds
        wake_up.handle_incoming(7, &[INTERVAL_REPORT, 0x00, 0x0e, 0x10]);
        assert_eq!(wake_up.interval_secs(), 3600);

        let state = wake_up.serialize();
        let mut restored = WakeUp::new();
        restored.deserialize(&state);
        assert_eq!(restored.interval_secs(), 3600);
    }

    #[test]
    fn no_more_information_is_never_parked() {
        let mut wake_up = WakeUp::new();
        let mut goodbye = WakeUp::no_more_information(7);
        goodbye.finalize(0x11).unwrap();
        wake_up.queue_item(QueueItem::Send(goodbye));
        assert_eq!(wake_up.pending_len(), 0);

        let mut msg = Message::new("anything else", 7, REQUEST, crate::protocol::func::ZW_SEND_DATA, false);
        msg.finalize(0).unwrap();
        wake_up.queue_item(QueueItem::Send(msg));
        assert_eq!(wake_up.pending_len(), 1);
    }

    #[test]
    fn pending_items_keep_their_order() {
        let mut wake_up = WakeUp::new();
        for node in [1u8, 2, 3] {
            let mut msg = Message::new("ordered", node, REQUEST, crate::protocol::func::ZW_SEND_DATA, false);
            msg.finalize(0).unwrap();
            wake_up.queue_item(QueueItem::Send(msg));
        }
        let order: Vec<u8> = wake_up.take_pending().iter().map(QueueItem::target_node_id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
