//! The five prioritized send queues and their signals.
//!
//! Priority order is fixed: Command > WakeUp > Send > Query > Poll. Each
//! queue is FIFO and carries a `watch` signal that is set exactly when the
//! queue is non-empty; the driver loop waits on the union of the signals and
//! always drains the highest-priority non-empty queue first.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::{watch, Notify};

use crate::node::QueryStage;
use crate::protocol::message::Message;

/// Scheduler queue identities, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgQueue {
    /// Controller management traffic
    Command = 0,
    /// Buffered traffic released when a sleeper wakes
    WakeUp = 1,
    /// Ordinary user requests
    Send = 2,
    /// Node interrogation traffic
    Query = 3,
    /// Periodic value refresh
    Poll = 4,
}

impl MsgQueue {
    /// All queues in priority order.
    pub const ALL: [MsgQueue; 5] = [
        MsgQueue::Command,
        MsgQueue::WakeUp,
        MsgQueue::Send,
        MsgQueue::Query,
        MsgQueue::Poll,
    ];
}

/// One scheduler entry: either a message to transmit, or the marker that
/// drives a node's query-stage advance inline with queue ordering.
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// Transmit this finalised message
    Send(Message),
    /// The named stage has all its responses; validate and advance
    QueryStageComplete {
        /// Node whose stage completed
        node_id: u8,
        /// The completed stage
        stage: QueryStage,
    },
}

impl QueueItem {
    /// Node the item is bound for.
    pub fn target_node_id(&self) -> u8 {
        match self {
            QueueItem::Send(msg) => msg.target_node_id(),
            QueueItem::QueryStageComplete { node_id, .. } => *node_id,
        }
    }
}

/// The five queues behind the send mutex.
///
/// The mutex is held only for pushes, pops and sweeps; never across I/O.
pub struct SendQueues {
    queues: Mutex<[VecDeque<QueueItem>; 5]>,
    signals: [watch::Sender<bool>; 5],
    changed: Notify,
}

impl Default for SendQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueues {
    /// Create five empty queues with clear signals.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Default::default()),
            signals: std::array::from_fn(|_| watch::channel(false).0),
            changed: Notify::new(),
        }
    }

    /// Append an item and set the queue's signal.
    pub fn push(&self, queue: MsgQueue, item: QueueItem) {
        {
            let mut queues = self.queues.lock().unwrap();
            queues[queue as usize].push_back(item);
            self.signals[queue as usize].send_replace(true);
        }
        self.changed.notify_waiters();
    }

    /// Append several items preserving their order (wake-up delivery).
    pub fn extend(&self, queue: MsgQueue, items: impl IntoIterator<Item = QueueItem>) {
        let mut pushed = false;
        {
            let mut queues = self.queues.lock().unwrap();
            for item in items {
                queues[queue as usize].push_back(item);
                pushed = true;
            }
            if pushed {
                self.signals[queue as usize].send_replace(true);
            }
        }
        if pushed {
            self.changed.notify_waiters();
        }
    }

    /// Pop the head of `queue`, clearing its signal when it empties.
    pub fn pop(&self, queue: MsgQueue) -> Option<QueueItem> {
        let mut queues = self.queues.lock().unwrap();
        let item = queues[queue as usize].pop_front();
        if queues[queue as usize].is_empty() {
            self.signals[queue as usize].send_replace(false);
        }
        item
    }

    /// Highest-priority non-empty queue, if any.
    pub fn first_non_empty(&self) -> Option<MsgQueue> {
        let queues = self.queues.lock().unwrap();
        MsgQueue::ALL
            .into_iter()
            .find(|&q| !queues[q as usize].is_empty())
    }

    /// Wait until some queue is non-empty and return the highest-priority
    /// one. Level-triggered: returns immediately when work is already
    /// queued.
    pub async fn wait_any(&self) -> MsgQueue {
        loop {
            let notified = self.changed.notified();
            if let Some(queue) = self.first_non_empty() {
                return queue;
            }
            notified.await;
        }
    }

    /// Remove every item bound for `node_id` from every queue, returning the
    /// removed items in priority-then-FIFO order. Signals are cleared for
    /// queues that empty. Used by sleeping-node redirection.
    pub fn drain_for_node(&self, node_id: u8) -> Vec<QueueItem> {
        let mut queues = self.queues.lock().unwrap();
        let mut moved = Vec::new();
        for q in MsgQueue::ALL {
            let deque = &mut queues[q as usize];
            let mut kept = VecDeque::with_capacity(deque.len());
            for item in deque.drain(..) {
                if item.target_node_id() == node_id {
                    moved.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *deque = kept;
            if queues[q as usize].is_empty() {
                self.signals[q as usize].send_replace(false);
            }
        }
        moved
    }

    /// Whether the queue's signal is currently set. The signal is maintained
    /// set-iff-non-empty.
    pub fn signal_set(&self, queue: MsgQueue) -> bool {
        *self.signals[queue as usize].borrow()
    }

    /// Number of items currently queued.
    pub fn len(&self, queue: MsgQueue) -> usize {
        self.queues.lock().unwrap()[queue as usize].len()
    }

    /// True when every queue is empty.
    pub fn is_empty(&self) -> bool {
        let queues = self.queues.lock().unwrap();
        queues.iter().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Message;
    use crate::protocol::{func, REQUEST};

    fn msg(node: u8) -> QueueItem {
        let mut m = Message::new("test", node, REQUEST, func::ZW_SEND_DATA, false);
        m.finalize(0).unwrap();
        QueueItem::Send(m)
    }

    #[test]
    fn signal_tracks_emptiness() {
        let queues = SendQueues::new();
        assert!(!queues.signal_set(MsgQueue::Send));

        queues.push(MsgQueue::Send, msg(4));
        assert!(queues.signal_set(MsgQueue::Send));

        queues.pop(MsgQueue::Send).unwrap();
        assert!(!queues.signal_set(MsgQueue::Send));
    }

    #[test]
    fn priority_order_wins() {
        let queues = SendQueues::new();
        queues.push(MsgQueue::Poll, msg(1));
        queues.push(MsgQueue::Query, msg(2));
        queues.push(MsgQueue::Command, msg(3));

        assert_eq!(queues.first_non_empty(), Some(MsgQueue::Command));
        queues.pop(MsgQueue::Command);
        assert_eq!(queues.first_non_empty(), Some(MsgQueue::Query));
        queues.pop(MsgQueue::Query);
        assert_eq!(queues.first_non_empty(), Some(MsgQueue::Poll));
    }

    #[test]
    fn fifo_within_a_queue() {
        let queues = SendQueues::new();
        queues.push(MsgQueue::Send, msg(1));
        queues.push(MsgQueue::Send, msg(2));
        queues.push(MsgQueue::Send, msg(3));

        let order: Vec<u8> = std::iter::from_fn(|| queues.pop(MsgQueue::Send))
            .map(|i| i.target_node_id())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn drain_for_node_sweeps_every_queue() {
        let queues = SendQueues::new();
        queues.push(MsgQueue::Send, msg(7));
        queues.push(MsgQueue::Send, msg(3));
        queues.push(MsgQueue::Query, msg(7));
        queues.push(
            MsgQueue::Query,
            QueueItem::QueryStageComplete {
                node_id: 7,
                stage: QueryStage::NodeInfo,
            },
        );

        let moved = queues.drain_for_node(7);
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|i| i.target_node_id() == 7));
        assert_eq!(queues.len(MsgQueue::Send), 1);
        assert_eq!(queues.len(MsgQueue::Query), 0);
        assert!(!queues.signal_set(MsgQueue::Query));
        assert!(queues.signal_set(MsgQueue::Send));
    }

    #[tokio::test]
    async fn wait_any_is_level_triggered() {
        let queues = SendQueues::new();
        queues.push(MsgQueue::Poll, msg(1));
        assert_eq!(queues.wait_any().await, MsgQueue::Poll);
    }
}
