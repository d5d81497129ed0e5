//! External notifications and the deferred fan-out bus.
//!
//! Producers queue notifications at any point; the driver task drains the
//! queue to subscribers after every wait iteration, so watchers observe a
//! single FIFO stream per driver. Watchers must not call back into the
//! driver except through its public API.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::value::ValueId;

/// Events delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A node entry was created (table insert or snapshot load)
    NodeAdded {
        /// Network id
        home_id: u32,
        /// New node
        node_id: u8,
    },
    /// A node unknown to the snapshot appeared in the init data
    NodeNew {
        /// Network id
        home_id: u32,
        /// Newly discovered node
        node_id: u8,
    },
    /// A node was unlinked from the table
    NodeRemoved {
        /// Network id
        home_id: u32,
        /// Removed node
        node_id: u8,
    },
    /// A node finished its interrogation pipeline
    NodeReady {
        /// Network id
        home_id: u32,
        /// Node that completed
        node_id: u8,
    },
    /// Every listening node is interrogated; only sleepers remain
    AwakeNodesQueried {
        /// Network id
        home_id: u32,
    },
    /// Every node, sleepers included, is interrogated
    AllNodesQueried {
        /// Network id
        home_id: u32,
    },
    /// The controller handshake finished and the node table is live
    DriverReady {
        /// Network id
        home_id: u32,
        /// The controller's own node id
        node_id: u8,
    },
    /// The transport could not be opened within the attempt budget
    DriverFailed,
    /// All node state was dropped for a fresh interrogation
    DriverReset {
        /// Network id
        home_id: u32,
    },
    /// A command class instantiated a new value
    ValueAdded(ValueId),
    /// A polled or unsolicited report changed a value
    ValueChanged(ValueId),
    /// A value disappeared with its node
    ValueRemoved(ValueId),
    /// Association group membership changed
    Group {
        /// Network id
        home_id: u32,
        /// Node owning the group
        node_id: u8,
        /// Group index, 1-based
        group_id: u8,
    },
    /// A virtual-node button was created (bridge controllers)
    ButtonCreate {
        /// Owning node
        node_id: u8,
        /// Logical button id
        button_id: u8,
    },
    /// A virtual-node button was deleted
    ButtonDelete {
        /// Owning node
        node_id: u8,
        /// Logical button id
        button_id: u8,
    },
    /// A button was pressed on
    ButtonOn {
        /// Owning node
        node_id: u8,
        /// Logical button id
        button_id: u8,
    },
    /// A button was pressed off
    ButtonOff {
        /// Owning node
        node_id: u8,
        /// Logical button id
        button_id: u8,
    },
    /// A transaction closed (emitted only with the notify_transactions
    /// option)
    MsgComplete {
        /// Network id
        home_id: u32,
    },
}

/// The deferred notification queue plus subscriber registry.
#[derive(Default)]
pub struct NotificationBus {
    pending: Mutex<VecDeque<Notification>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl NotificationBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a notification for the next drain.
    pub fn queue(&self, notification: Notification) {
        self.pending.lock().unwrap().push_back(notification);
    }

    /// Register a watcher; the returned receiver yields every notification
    /// queued after this call, in production order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver everything queued so far. Dead receivers are dropped from the
    /// registry.
    pub fn drain(&self) {
        loop {
            let Some(notification) = self.pending.lock().unwrap().pop_front() else {
                break;
            };
            tracing::trace!(?notification, "notify watchers");
            let mut watchers = self.watchers.lock().unwrap();
            watchers.retain(|tx| tx.send(notification.clone()).is_ok());
        }
    }

    /// Number of queued, undelivered notifications.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_delivery_per_subscriber() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();

        bus.queue(Notification::NodeAdded { home_id: 1, node_id: 2 });
        bus.queue(Notification::NodeReady { home_id: 1, node_id: 2 });
        bus.drain();

        assert_eq!(rx.recv().await, Some(Notification::NodeAdded { home_id: 1, node_id: 2 }));
        assert_eq!(rx.recv().await, Some(Notification::NodeReady { home_id: 1, node_id: 2 }));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = NotificationBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.queue(Notification::DriverFailed);
        bus.drain();
        assert_eq!(bus.watchers.lock().unwrap().len(), 0);
    }

    #[test]
    fn drain_on_empty_bus_is_a_no_op() {
        let bus = NotificationBus::new();
        bus.drain();
        assert_eq!(bus.pending_len(), 0);
    }
}
