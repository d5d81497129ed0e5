//! The driver task: multi-wait, framing and the transaction engine.
//!
//! One loop owns the transport. While no transaction is in flight it waits
//! on {exit, bytes available, the five queue signals}; while one is in
//! flight the queue signals are masked and the wait is bounded by the retry
//! deadline. Inbound bytes are classified (ACK / NAK / CAN / SOF / out of
//! frame), frames are checksummed and dispatched, and the shared transaction
//! expectations decide when the in-flight message is done.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::message::Message;
use crate::protocol::{checksum, ACK, CAN, NAK, SOF};
use crate::queue::{MsgQueue, QueueItem};
use crate::stats::Counters;
use crate::{notification::Notification, MAX_TRIES, RETRY_TIMEOUT};

use super::DriverInner;

/// Deadline for the length byte after an SOF.
const FRAME_LENGTH_TIMEOUT: Duration = Duration::from_millis(100);
/// Deadline for the body once the length is known.
const FRAME_BODY_TIMEOUT: Duration = Duration::from_millis(500);

/// Backoff while the transport will not open: every 5 s for the first 25
/// attempts, every 30 s after that.
const OPEN_RETRY_SHORT: Duration = Duration::from_secs(5);
const OPEN_RETRY_LONG: Duration = Duration::from_secs(30);
const OPEN_RETRY_SHORT_ATTEMPTS: u32 = 25;

/// The single shared transaction: at most one message is in flight, and
/// these expectations decide when it completes. Owned exclusively by the
/// driver task.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub current: Option<Message>,
    pub waiting_for_ack: bool,
    pub expected_callback_id: u8,
    pub expected_reply: u8,
    pub expected_command_class_id: u8,
    pub expected_node_id: u8,
    pub retry_deadline: Option<Instant>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction is live while any completion condition is outstanding.
    pub fn live(&self) -> bool {
        self.waiting_for_ack || self.expected_callback_id != 0 || self.expected_reply != 0
    }

    /// Reset every expectation and drop the current message.
    pub fn clear(&mut self) {
        self.current = None;
        self.waiting_for_ack = false;
        self.expected_callback_id = 0;
        self.expected_reply = 0;
        self.expected_command_class_id = 0;
        self.expected_node_id = 0;
        self.retry_deadline = None;
    }
}

impl DriverInner {
    /// Driver task entry point: open the transport (with backoff), run the
    /// handshake and the event loop, and persist on the way out.
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempts: u32 = 0;
        loop {
            match self.port.open().await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(attempt = attempts, error = %e, "failed to open the controller");
                    let max = self.options.driver_max_attempts;
                    if max != 0 && attempts >= max {
                        tracing::error!("transport unreachable after {attempts} attempts, giving up");
                        self.bus.queue(Notification::DriverFailed);
                        self.bus.drain();
                        return;
                    }
                    let backoff = if attempts < OPEN_RETRY_SHORT_ATTEMPTS {
                        OPEN_RETRY_SHORT
                    } else {
                        OPEN_RETRY_LONG
                    };
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        self.play_init_sequence();
        self.event_loop(&mut shutdown).await;

        if self.options.save_configuration {
            if let Err(e) = self.write_snapshot() {
                tracing::warn!(error = %e, "snapshot not written at shutdown");
            }
        }
        self.port.close();
        self.bus.drain();
    }

    /// Knock the chip out of any half-received frame, then queue the opening
    /// handshake in the port's preferred order.
    fn play_init_sequence(&self) {
        if let Err(e) = self.port.write(&[NAK]) {
            tracing::warn!(error = %e, "could not write the opening NAK");
        }
        for function in self.port.init_sequence() {
            let mut msg = Message::new(
                crate::protocol::func::name(function),
                crate::protocol::CONTROLLER_NODE_ID,
                crate::protocol::REQUEST,
                function,
                false,
            );
            msg.expect_reply(function);
            self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
        }
    }

    async fn event_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut txn = Transaction::new();
        loop {
            // Deferred notifications go out between waits, never from inside
            // a handler.
            self.bus.drain();

            if *shutdown.borrow() {
                tracing::debug!("exit signalled, abandoning in-flight transaction");
                return;
            }

            if txn.live() {
                // Only inbound data and exit can progress a live
                // transaction; queue signals stay masked.
                let deadline = txn
                    .retry_deadline
                    .unwrap_or_else(|| Instant::now() + RETRY_TIMEOUT);
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    _ = self.port.readable() => { self.read_msg(&mut txn).await; }
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::info!("transaction timed out, resending");
                        self.write_current(&mut txn);
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    _ = self.port.readable() => { self.read_msg(&mut txn).await; }
                    queue = self.queues.wait_any() => { self.write_next(&mut txn, queue); }
                }
            }
        }
    }

    /// Pop the head of `queue` and act on it: arm a message, or commit a
    /// query-stage marker inline.
    fn write_next(&self, txn: &mut Transaction, queue: MsgQueue) {
        match self.queues.pop(queue) {
            Some(QueueItem::Send(msg)) => {
                txn.current = Some(msg);
                self.write_current(txn);
            }
            Some(QueueItem::QueryStageComplete { node_id, stage }) => {
                tracing::debug!(node_id, %stage, "query stage marker");
                let (committed, actions, completed) = {
                    let mut nodes = self.nodes.lock().unwrap();
                    match nodes.get_mut(node_id) {
                        Some(node) => {
                            let committed = node.query_stage_complete(stage);
                            let actions = node.advance_queries();
                            let completed = node.query_stage() == crate::node::QueryStage::Complete;
                            (committed, actions, completed)
                        }
                        None => return,
                    }
                };
                if committed && completed {
                    let home_id = self.info.lock().unwrap().home_id;
                    self.bus.queue(Notification::NodeReady { home_id, node_id });
                }
                self.perform_query_actions(node_id, actions);
                self.check_completed_node_queries();
            }
            None => {}
        }
    }

    /// Write (or rewrite) the current message, arming the shared transaction
    /// state. Drops the message once the attempt budget is spent.
    pub(crate) fn write_current(&self, txn: &mut Transaction) -> bool {
        let Some(msg) = txn.current.as_mut() else {
            tracing::warn!("no current message to write");
            txn.clear();
            return false;
        };

        if msg.send_attempts() >= MAX_TRIES {
            tracing::error!(
                node_id = msg.target_node_id(),
                tries = MAX_TRIES,
                "dropping command, expected response never arrived"
            );
            Counters::bump(&self.stats.dropped);
            txn.clear();
            return false;
        }

        if msg.send_attempts() > 0 {
            Counters::bump(&self.stats.retries);
        }
        msg.record_attempt();

        txn.expected_callback_id = msg.callback_id();
        txn.expected_command_class_id = msg.expected_command_class_id();
        txn.expected_node_id = msg.target_node_id();
        txn.expected_reply = msg.expected_reply();
        txn.waiting_for_ack = true;
        txn.retry_deadline = Some(Instant::now() + RETRY_TIMEOUT);

        tracing::info!(
            node_id = msg.target_node_id(),
            callback = format_args!("0x{:02x}", msg.callback_id()),
            reply = format_args!("0x{:02x}", msg.expected_reply()),
            attempt = msg.send_attempts(),
            %msg,
            "sending"
        );

        if let Err(e) = self.port.write(msg.buffer()) {
            tracing::warn!(error = %e, "write failed; the retry timer will try again");
        }
        Counters::bump(&self.stats.write_cnt);

        let target = msg.target_node_id();
        if target == crate::protocol::CONTROLLER_NODE_ID {
            Counters::bump(&self.stats.controller_write_cnt);
        } else if let Some(node) = self.nodes.lock().unwrap().get_mut(target) {
            node.count_write();
        }
        true
    }

    /// Read and classify one inbound byte; on SOF, read the whole frame
    /// under the framing deadlines.
    pub(crate) async fn read_msg(&self, txn: &mut Transaction) {
        let mut byte = [0u8; 1];
        if self.port.read(&mut byte) == 0 {
            return;
        }

        match byte[0] {
            SOF => {
                Counters::bump(&self.stats.sof_cnt);
                if txn.waiting_for_ack {
                    // The ACK may still arrive; process the frame regardless.
                    tracing::info!("unsolicited frame while waiting for ACK");
                    Counters::bump(&self.stats.ack_waiting);
                }
                self.read_frame(txn).await;
            }
            CAN => {
                tracing::info!("CAN received, resending");
                Counters::bump(&self.stats.can_cnt);
                self.write_current(txn);
            }
            NAK => {
                tracing::info!("NAK received, resending");
                Counters::bump(&self.stats.nak_cnt);
                self.write_current(txn);
            }
            ACK => {
                Counters::bump(&self.stats.ack_cnt);
                tracing::debug!(
                    callback = format_args!("0x{:02x}", txn.expected_callback_id),
                    reply = format_args!("0x{:02x}", txn.expected_reply),
                    "ACK received"
                );
                txn.waiting_for_ack = false;
                if txn.expected_callback_id == 0 && txn.expected_reply == 0 {
                    // Nothing more expected; the message is delivered.
                    self.close_transaction(txn);
                }
            }
            other => {
                tracing::info!(byte = format_args!("0x{other:02x}"), "out of frame flow, sending NAK");
                Counters::bump(&self.stats.oof_cnt);
                let _ = self.port.write(&[NAK]);
            }
        }
    }

    /// Read length and body after an SOF, verify the checksum, and answer
    /// ACK or NAK. Timeouts abort the frame without touching the outgoing
    /// message.
    async fn read_frame(&self, txn: &mut Transaction) {
        self.port.set_read_threshold(1);
        if tokio::time::timeout(FRAME_LENGTH_TIMEOUT, self.port.readable())
            .await
            .is_err()
        {
            tracing::warn!("length byte never arrived, aborting frame read");
            Counters::bump(&self.stats.read_aborts);
            return;
        }
        let mut length = [0u8; 1];
        if self.port.read(&mut length) == 0 {
            Counters::bump(&self.stats.read_aborts);
            return;
        }
        let length = usize::from(length[0]);
        if length == 0 {
            Counters::bump(&self.stats.read_aborts);
            return;
        }

        self.port.set_read_threshold(length);
        let body_ready = tokio::time::timeout(FRAME_BODY_TIMEOUT, self.port.readable()).await;
        self.port.set_read_threshold(1);
        if body_ready.is_err() {
            tracing::warn!(length, "frame body never arrived, aborting frame read");
            Counters::bump(&self.stats.read_aborts);
            return;
        }
        let mut body = vec![0u8; length];
        if self.port.read(&mut body) < length {
            Counters::bump(&self.stats.read_aborts);
            return;
        }

        // Checksum covers the length byte and the body up to the checksum
        // itself.
        let mut covered = Vec::with_capacity(length);
        covered.push(length as u8);
        covered.extend_from_slice(&body[..length - 1]);
        let expected = checksum(&covered);
        if body[length - 1] != expected {
            tracing::warn!(
                expected = format_args!("0x{expected:02x}"),
                actual = format_args!("0x{:02x}", body[length - 1]),
                "checksum incorrect, sending NAK"
            );
            Counters::bump(&self.stats.bad_checksum);
            let _ = self.port.write(&[NAK]);
            return;
        }

        let _ = self.port.write(&[ACK]);
        Counters::bump(&self.stats.read_cnt);
        tracing::debug!(bytes = %hex::encode(&body[..length - 1]), "frame received");
        self.process_frame(txn, &body[..length - 1]);
    }

    /// Close the transaction, emitting MsgComplete when asked to.
    pub(crate) fn close_transaction(&self, txn: &mut Transaction) {
        tracing::debug!("message transaction complete");
        txn.clear();
        if self.options.notify_transactions {
            let home_id = self.info.lock().unwrap().home_id;
            self.bus.queue(Notification::MsgComplete { home_id });
        }
    }

    /// Match an inbound frame against the shared expectations; called for
    /// every frame the dispatcher did not claim for itself.
    pub(crate) fn handle_expectations(&self, txn: &mut Transaction, data: &[u8]) {
        if txn.expected_callback_id == 0 && txn.expected_reply == 0 {
            return;
        }

        if txn.expected_callback_id != 0 && data.len() > 2 && txn.expected_callback_id == data[2] {
            tracing::debug!("expected callback id received");
            txn.expected_callback_id = 0;
        }

        if txn.expected_reply != 0 && txn.expected_reply == data[1] {
            if txn.expected_command_class_id != 0
                && txn.expected_reply == crate::protocol::func::APPLICATION_COMMAND_HANDLER
            {
                // Application-command replies must come from the node we
                // asked, carrying the class we asked about.
                if data.len() > 5
                    && txn.expected_command_class_id == data[5]
                    && txn.expected_node_id == data[3]
                {
                    tracing::debug!("expected reply and command class received");
                    txn.expected_reply = 0;
                    txn.expected_command_class_id = 0;
                    txn.expected_node_id = 0;
                }
            } else {
                tracing::debug!("expected reply received");
                txn.expected_reply = 0;
            }
        }

        if txn.expected_callback_id == 0 && txn.expected_reply == 0 {
            self.close_transaction(txn);
        }
    }
}
