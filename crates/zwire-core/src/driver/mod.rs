//! The driver: one controller, one link, one transaction at a time.
//!
//! # Module structure
//!
//! - this module - the public [`Driver`] handle and the shared state behind
//!   it (node table, queues, poll list, notification bus, counters)
//! - [`event_loop`] - the driver task: multi-wait, framing, the transaction
//!   engine and retry
//! - [`handlers`] - inbound frame dispatch by function id
//! - [`controller_cmd`] - the network-management command state machine
//!
//! Producers (public API calls, the query advancer, the poller, wake
//! delivery) only enqueue; the driver task is the sole owner of the
//! transport and the transaction state.

mod controller_cmd;
mod event_loop;
mod handlers;

pub use controller_cmd::{ControllerCommand, ControllerState};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use zwire_serial::ControllerPort;

use crate::command_class::{basic, wake_up, ClassEvent};
use crate::config::DriverOptions;
use crate::error::DriverError;
use crate::node::{Node, NodeTable, QueryAction, QueryStage};
use crate::notification::{Notification, NotificationBus};
use crate::persist::{self, ButtonMap, DriverInfo};
use crate::poll::PollList;
use crate::protocol::message::{send_data, Message};
use crate::protocol::{func, CONTROLLER_NODE_ID, LIBRARY_TYPE_BRIDGE, NUM_NODE_BITFIELD_BYTES, REQUEST};
use crate::queue::{MsgQueue, QueueItem, SendQueues};
use crate::stats::{Counters, DriverStatistics};
use crate::value::ValueId;

use self::controller_cmd::CommandSession;
use self::event_loop::Transaction;

/// Identity and capabilities learned from the controller chip.
#[derive(Debug, Default)]
pub(crate) struct ControllerInfo {
    pub home_id: u32,
    pub node_id: u8,
    pub library_version: String,
    pub library_type: u8,
    pub init_version: u8,
    pub api_capabilities: u8,
    pub controller_capabilities: u8,
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub api_mask: [u8; 32],
    pub suc_node_id: u8,
    pub virtual_nodes: [u8; NUM_NODE_BITFIELD_BYTES],
    pub virtual_nodes_received: bool,
}

impl ControllerInfo {
    pub fn is_bridge(&self) -> bool {
        self.library_type == LIBRARY_TYPE_BRIDGE
    }

    pub fn is_virtual_node(&self, node_id: u8) -> bool {
        if !self.virtual_nodes_received || node_id < 1 {
            return false;
        }
        let bit = usize::from(node_id) - 1;
        self.virtual_nodes[bit / 8] & (1 << (bit % 8)) != 0
    }
}

pub(crate) struct DriverInner {
    pub options: DriverOptions,
    pub port: Arc<dyn ControllerPort>,
    pub queues: SendQueues,
    pub nodes: Mutex<NodeTable>,
    pub poll_list: PollList,
    pub bus: NotificationBus,
    pub stats: Counters,
    pub info: Mutex<ControllerInfo>,
    pub command: Mutex<CommandSession>,
    pub buttons: Mutex<ButtonMap>,
    next_callback_id: AtomicU8,
    pub init: AtomicBool,
    pub awake_nodes_queried: AtomicBool,
    pub all_nodes_queried: AtomicBool,
    running: AtomicBool,
    pub shutdown_tx: watch::Sender<bool>,
    poll_interval_ms: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one running driver. Cheap to clone; the last clone dropping
/// does not stop the tasks - call [`Driver::shutdown`].
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

impl Driver {
    /// Create a driver for the given port. Nothing runs until
    /// [`start`](Driver::start).
    pub fn new(port: Arc<dyn ControllerPort>, options: DriverOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let poll_interval_ms = options.poll_interval.as_millis() as u64;
        let buttons = ButtonMap::load(&options.user_path);
        Self {
            inner: Arc::new(DriverInner {
                options,
                port,
                queues: SendQueues::new(),
                nodes: Mutex::new(NodeTable::new()),
                poll_list: PollList::new(),
                bus: NotificationBus::new(),
                stats: Counters::default(),
                info: Mutex::new(ControllerInfo::default()),
                command: Mutex::new(CommandSession::default()),
                buttons: Mutex::new(buttons),
                next_callback_id: AtomicU8::new(0),
                init: AtomicBool::new(false),
                awake_nodes_queried: AtomicBool::new(false),
                all_nodes_queried: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown_tx,
                poll_interval_ms: AtomicU64::new(poll_interval_ms),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the driver task and the poll task.
    pub fn start(&self) -> Result<(), DriverError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DriverError::AlreadyRunning);
        }

        let driver = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        let driver_task = tokio::spawn(async move { driver.run(shutdown).await });

        let poller = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        let poll_task = tokio::spawn(async move { poller.poll_loop(shutdown).await });

        self.inner.tasks.lock().unwrap().extend([driver_task, poll_task]);
        Ok(())
    }

    /// Signal exit and wait for the tasks to finish. In-flight transactions
    /// are abandoned; the snapshot is written first when the
    /// save_configuration option is set.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Register a notification watcher.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.inner.bus.subscribe()
    }

    /// Queue a message on one of the scheduler queues (subject to
    /// sleeping-node redirection).
    pub fn send_msg(&self, msg: Message, queue: MsgQueue) {
        self.inner.enqueue_item(queue, QueueItem::Send(msg));
    }

    /// Cumulative link statistics.
    pub fn statistics(&self) -> DriverStatistics {
        self.inner.stats.snapshot()
    }

    /// Per-node frame counters `(read, write)`.
    pub fn node_statistics(&self, node_id: u8) -> Option<(u32, u32)> {
        let nodes = self.inner.nodes.lock().unwrap();
        nodes.get(node_id).map(|n| (n.read_cnt(), n.write_cnt()))
    }

    /// Network id, 0 until the handshake answers.
    pub fn home_id(&self) -> u32 {
        self.inner.info.lock().unwrap().home_id
    }

    /// The controller's own node id.
    pub fn controller_node_id(&self) -> u8 {
        self.inner.info.lock().unwrap().node_id
    }

    /// Protocol library version string reported by the chip.
    pub fn library_version(&self) -> String {
        self.inner.info.lock().unwrap().library_version.clone()
    }

    /// Whether the chip runs the bridge library (virtual nodes, buttons).
    pub fn is_bridge_controller(&self) -> bool {
        self.inner.info.lock().unwrap().is_bridge()
    }

    /// SUC node id, 0 when the network has none.
    pub fn suc_node_id(&self) -> u8 {
        self.inner.info.lock().unwrap().suc_node_id
    }

    /// Ids of the currently known nodes.
    pub fn node_ids(&self) -> Vec<u8> {
        self.inner.nodes.lock().unwrap().iter().map(Node::id).collect()
    }

    /// A node's interrogation stage.
    pub fn node_query_stage(&self, node_id: u8) -> Option<QueryStage> {
        self.inner.nodes.lock().unwrap().get(node_id).map(Node::query_stage)
    }

    /// A node's human-editable name.
    pub fn node_name(&self, node_id: u8) -> Option<String> {
        self.inner
            .nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| n.name().to_string())
    }

    /// Set a node's human-editable name.
    pub fn set_node_name(&self, node_id: u8, name: &str) -> Result<(), DriverError> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        let node = nodes.get_mut(node_id).ok_or(DriverError::UnknownNode(node_id))?;
        node.set_name(name);
        Ok(())
    }

    /// Set a node's human-editable location.
    pub fn set_node_location(&self, node_id: u8, location: &str) -> Result<(), DriverError> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        let node = nodes.get_mut(node_id).ok_or(DriverError::UnknownNode(node_id))?;
        node.set_location(location);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Add a value to the poll rotation. Fails when the node is unknown or
    /// does not advertise the class.
    pub fn enable_poll(&self, value: ValueId) -> Result<bool, DriverError> {
        {
            let nodes = self.inner.nodes.lock().unwrap();
            let node = nodes.get(value.node_id).ok_or(DriverError::UnknownNode(value.node_id))?;
            if !node.has_class(value.class_id) {
                return Err(DriverError::UnknownNode(value.node_id));
            }
        }
        Ok(self.inner.poll_list.enable(value))
    }

    /// Remove a value from the poll rotation.
    pub fn disable_poll(&self, value: ValueId) -> bool {
        self.inner.poll_list.disable(value)
    }

    /// Whether a value is in the poll rotation.
    pub fn is_polled(&self, value: &ValueId) -> bool {
        self.inner.poll_list.is_polled(value)
    }

    /// Change the sweep interval for the whole poll list.
    pub fn set_poll_interval(&self, interval: Duration) {
        self.inner
            .poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Network management
    // -----------------------------------------------------------------------

    /// Start a controller network-management command. The returned channel
    /// follows the command's progress; it fails when another command is in
    /// flight.
    pub fn begin_controller_command(
        &self,
        command: ControllerCommand,
        node_id: u8,
        high_power: bool,
    ) -> Result<watch::Receiver<ControllerState>, DriverError> {
        self.inner.begin_controller_command(command, node_id, high_power)
    }

    /// Cancel the active controller command. Returns false when no command
    /// is active or the command cannot be cancelled (HasNodeFailed,
    /// RemoveFailedNode, ReplaceFailedNode have no stop opcode).
    pub fn cancel_controller_command(&self) -> bool {
        self.inner.cancel_controller_command()
    }

    /// Soft-reset the controller chip.
    pub fn reset(&self) {
        let msg = Message::new("soft reset", CONTROLLER_NODE_ID, REQUEST, func::SERIAL_API_SOFT_RESET, false);
        self.send_msg(msg, MsgQueue::Command);
    }

    /// Drop every node and re-interrogate the network from fresh init data.
    pub fn init_all_nodes(&self) {
        let home_id = self.home_id();
        let ids: Vec<u8> = self.inner.nodes.lock().unwrap().iter().map(Node::id).collect();
        for node_id in ids {
            self.inner.unlink_node(node_id);
        }
        self.inner.bus.queue(Notification::DriverReset { home_id });
        self.inner.all_nodes_queried.store(false, Ordering::SeqCst);
        self.inner.awake_nodes_queried.store(false, Ordering::SeqCst);

        let mut msg = Message::new(
            "re-request init data",
            CONTROLLER_NODE_ID,
            REQUEST,
            func::SERIAL_API_GET_INIT_DATA,
            false,
        );
        msg.expect_reply(func::SERIAL_API_GET_INIT_DATA);
        self.send_msg(msg, MsgQueue::Send);
    }

    /// Re-run the session-ephemeral stages (Dynamic onwards) for a node.
    pub fn request_node_state(&self, node_id: u8) -> Result<(), DriverError> {
        self.inner.reopen_node_queries(node_id, QueryStage::Dynamic)
    }

    /// Re-run the whole interrogation pipeline for a node.
    pub fn refresh_node_info(&self, node_id: u8) -> Result<(), DriverError> {
        self.inner.reopen_node_queries(node_id, QueryStage::ProtocolInfo)
    }

    /// Ask the SUC for a network topology update.
    pub fn request_network_update(&self) -> Result<watch::Receiver<ControllerState>, DriverError> {
        self.begin_controller_command(ControllerCommand::RequestNetworkUpdate, 0, false)
    }

    /// Broadcast SwitchAll on.
    pub fn switch_all_on(&self) {
        self.send_msg(
            send_data("switch all on", CONTROLLER_NODE_ID, 0x27, 0x04, &[]),
            MsgQueue::Send,
        );
    }

    /// Broadcast SwitchAll off.
    pub fn switch_all_off(&self) {
        self.send_msg(
            send_data("switch all off", CONTROLLER_NODE_ID, 0x27, 0x05, &[]),
            MsgQueue::Send,
        );
    }

    /// Send `count` no-op probes to every known node to exercise the mesh.
    pub fn test_network(&self, count: u32) {
        let ids = self.node_ids();
        for _ in 0..count {
            for &node_id in &ids {
                self.send_msg(send_data("network test no-op", node_id, 0x00, 0x00, &[]), MsgQueue::Send);
            }
        }
    }

    /// Write the snapshot now.
    pub fn write_snapshot(&self) -> Result<std::path::PathBuf, DriverError> {
        self.inner.write_snapshot()
    }
}

impl DriverInner {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::SeqCst))
    }

    /// Allocate the next callback id, wrapping through 1..=255; 0 always
    /// means "no callback expected".
    fn next_callback_id(&self) -> u8 {
        let prev = self
            .next_callback_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v >= 255 { 1 } else { v + 1 })
            })
            .unwrap();
        if prev >= 255 {
            1
        } else {
            prev + 1
        }
    }

    /// Finalise and enqueue an item, parking it on the target's sleeping
    /// buffer when the target is a sleeping non-listening device.
    pub(crate) fn enqueue_item(&self, queue: MsgQueue, mut item: QueueItem) {
        if let QueueItem::Send(msg) = &mut item {
            let callback_id = if msg.callback_required() && msg.callback_id() == 0 {
                self.next_callback_id()
            } else {
                msg.callback_id()
            };
            if let Err(e) = msg.finalize(callback_id) {
                tracing::error!(error = %e, "dropping unframeable message");
                return;
            }
        }

        let target = item.target_node_id();
        if target != CONTROLLER_NODE_ID {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get_mut(target) {
                if node.is_asleep() {
                    if let Some(wake_up) = node.wake_up_mut() {
                        tracing::debug!(node_id = target, "target asleep, parking on wake-up buffer");
                        wake_up.queue_item(item);
                        return;
                    }
                }
            }
        }

        self.queues.push(queue, item);
    }

    /// Mark the target asleep and move everything bound for it (the current
    /// message included) onto its sleeping buffer. "Wake Up No More
    /// Information" is dropped instead of moved. Returns false when the
    /// target is not a sleeping-capable device.
    pub(crate) fn move_messages_to_wake_up_queue(&self, txn: &mut Transaction, target: u8) -> bool {
        let mut nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get_mut(target) else {
            return false;
        };
        if node.is_listening() || node.is_frequent_listening() || node.is_controller() {
            return false;
        }
        let node_id = node.id();
        let Some(wake_up) = node.wake_up_mut() else {
            return false;
        };

        wake_up.set_awake(false);

        if let Some(msg) = txn.current.take() {
            if msg.target_node_id() == target {
                tracing::info!(node_id, %msg, "node not responding, moving current message to wake-up buffer");
                wake_up.queue_item(QueueItem::Send(msg));
                txn.clear();
            } else {
                txn.current = Some(msg);
            }
        }

        for item in self.queues.drain_for_node(target) {
            tracing::info!(node_id, "node not responding, moving queued item to wake-up buffer");
            wake_up.queue_item(item);
        }
        true
    }

    /// Deliver a woken node's buffered items onto the WakeUp queue, in their
    /// parked order, with the goodbye command last.
    pub(crate) fn deliver_wake_up_queue(&self, node_id: u8) {
        let (pending, poll_required) = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            let Some(wake_up) = node.wake_up_mut() else {
                return;
            };
            wake_up.set_awake(true);
            (wake_up.take_pending(), wake_up.take_poll_required())
        };

        let count = pending.len();
        self.queues.extend(MsgQueue::WakeUp, pending);
        tracing::info!(node_id, count, "sleeping buffer spliced onto wake-up queue");

        if poll_required {
            self.poll_node_values(node_id);
        }

        // The node stays on the wake-up queue until the goodbye round-trips.
        self.enqueue_item(
            MsgQueue::WakeUp,
            QueueItem::Send(wake_up::WakeUp::no_more_information(node_id)),
        );
    }

    /// Enqueue poll requests for every polled value on a node.
    pub(crate) fn poll_node_values(&self, node_id: u8) {
        let home_id = self.info.lock().unwrap().home_id;
        let value = ValueId::new(home_id, node_id, basic::CLASS_ID);
        if self.poll_list.is_polled(&value) {
            self.enqueue_item(MsgQueue::Poll, QueueItem::Send(basic::Basic::request_value(node_id)));
        }
    }

    /// Unlink a node from the table, retiring its values first so watchers
    /// never see a value without an owner. Returns false when the node was
    /// not known.
    pub(crate) fn unlink_node(&self, node_id: u8) -> bool {
        let home_id = self.info.lock().unwrap().home_id;
        let removed = self.nodes.lock().unwrap().remove(node_id);
        let Some(node) = removed else {
            return false;
        };
        for class_id in node.class_ids() {
            self.bus
                .queue(Notification::ValueRemoved(ValueId::new(home_id, node_id, class_id)));
        }
        self.bus.queue(Notification::NodeRemoved { home_id, node_id });
        true
    }

    /// Create (or recreate) a node and start its interrogation.
    pub(crate) fn init_node(&self, node_id: u8) {
        let home_id = self.info.lock().unwrap().home_id;
        self.unlink_node(node_id);
        let actions = {
            let mut nodes = self.nodes.lock().unwrap();
            let mut node = Node::new(node_id);
            let actions = node.advance_queries();
            nodes.insert(node);
            actions
        };
        self.bus.queue(Notification::NodeAdded { home_id, node_id });
        self.perform_query_actions(node_id, actions);
    }

    /// Enqueue the messages and marker a query-stage advance produced.
    pub(crate) fn perform_query_actions(&self, node_id: u8, actions: Vec<QueryAction>) {
        for action in actions {
            match action {
                QueryAction::Enqueue(msg) => self.enqueue_item(MsgQueue::Query, QueueItem::Send(msg)),
                QueryAction::Marker(stage) => {
                    self.enqueue_item(MsgQueue::Query, QueueItem::QueryStageComplete { node_id, stage })
                }
            }
        }
    }

    fn reopen_node_queries(&self, node_id: u8, stage: QueryStage) -> Result<(), DriverError> {
        let actions = {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes.get_mut(node_id).ok_or(DriverError::UnknownNode(node_id))?;
            node.set_query_stage(stage);
            node.advance_queries()
        };
        self.all_nodes_queried.store(false, Ordering::SeqCst);
        self.perform_query_actions(node_id, actions);
        Ok(())
    }

    /// Scan the table after each stage marker: emit AwakeNodesQueried once
    /// when only sleepers remain, AllNodesQueried once when everyone is
    /// done.
    pub(crate) fn check_completed_node_queries(&self) {
        if self.all_nodes_queried.load(Ordering::SeqCst) {
            return;
        }
        let (all, sleeping_only) = {
            let nodes = self.nodes.lock().unwrap();
            let mut all = true;
            let mut sleeping_only = true;
            for node in nodes.iter() {
                if node.query_stage() != QueryStage::Complete {
                    all = false;
                    if node.is_listening() {
                        sleeping_only = false;
                    }
                }
            }
            (all, sleeping_only)
        };

        let home_id = self.info.lock().unwrap().home_id;
        if all {
            tracing::info!("node query processing complete");
            self.bus.queue(Notification::AllNodesQueried { home_id });
            self.awake_nodes_queried.store(true, Ordering::SeqCst);
            self.all_nodes_queried.store(true, Ordering::SeqCst);
        } else if sleeping_only && !self.awake_nodes_queried.swap(true, Ordering::SeqCst) {
            tracing::info!("node query processing complete except for sleeping nodes");
            self.bus.queue(Notification::AwakeNodesQueried { home_id });
        }
    }

    /// Act on the typed events a command class produced for an inbound
    /// application command.
    pub(crate) fn apply_class_events(&self, node_id: u8, events: Vec<ClassEvent>) {
        let home_id = self.info.lock().unwrap().home_id;
        for event in events {
            match event {
                ClassEvent::WokeUp => self.deliver_wake_up_queue(node_id),
                ClassEvent::ValueChanged { class_id, index } => {
                    let mut value = ValueId::new(home_id, node_id, class_id);
                    value.index = index;
                    self.bus.queue(Notification::ValueChanged(value));
                }
                ClassEvent::Group { group_id } => {
                    self.bus.queue(Notification::Group { home_id, node_id, group_id });
                }
                ClassEvent::IntervalReport(secs) => {
                    tracing::debug!(node_id, secs, "wake-up interval recorded");
                }
            }
        }
    }

    /// Capture driver fields for the snapshot.
    pub(crate) fn driver_info(&self) -> DriverInfo {
        let info = self.info.lock().unwrap();
        DriverInfo {
            home_id: info.home_id,
            node_id: info.node_id,
            api_capabilities: info.api_capabilities,
            controller_capabilities: info.controller_capabilities,
            poll_interval_secs: self.poll_interval().as_secs(),
        }
    }

    pub(crate) fn write_snapshot(&self) -> Result<std::path::PathBuf, DriverError> {
        let info = self.driver_info();
        let nodes = self.nodes.lock().unwrap();
        persist::write_snapshot(&self.options.user_path, info, &nodes)
    }

    /// Load the snapshot once the handshake has told us who we are. Emits
    /// NodeAdded for every restored node. A mismatch is logged and the
    /// driver continues with an empty table.
    pub(crate) fn load_snapshot(&self) {
        let (home_id, node_id) = {
            let info = self.info.lock().unwrap();
            (info.home_id, info.node_id)
        };
        let restored = {
            let mut nodes = self.nodes.lock().unwrap();
            persist::read_snapshot(&self.options.user_path, home_id, node_id, &mut nodes)
        };
        match restored {
            Ok(ids) => {
                for node_id in ids {
                    self.bus.queue(Notification::NodeAdded { home_id, node_id });
                }
                if let Some(info) = persist::read_driver_info(&self.options.user_path, home_id) {
                    self.poll_interval_ms
                        .store(info.poll_interval_secs.saturating_mul(1000), Ordering::SeqCst);
                }
            }
            Err(DriverError::SnapshotIo(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no snapshot on disk, starting fresh");
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot rejected, starting fresh");
            }
        }
    }

    /// The polling loop: rotate the head to the tail each tick and sleep
    /// `interval / len` so a full sweep costs one interval. Sleeping targets
    /// are flagged for a deferred poll instead. Nothing polls until the
    /// awake nodes are interrogated.
    pub(crate) async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let interval = self.poll_interval();
            let mut sleep_for = interval;

            if self.awake_nodes_queried.load(Ordering::SeqCst) && !self.poll_list.is_empty() {
                if let Some(value) = self.poll_list.rotate() {
                    let len = self.poll_list.len().max(1);
                    sleep_for = interval / len as u32;
                    self.poll_value(value);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    pub(crate) fn poll_value(&self, value: ValueId) {
        let deferred = {
            let mut nodes = self.nodes.lock().unwrap();
            let Some(node) = nodes.get_mut(value.node_id) else {
                return;
            };
            if node.is_asleep() {
                if let Some(wake_up) = node.wake_up_mut() {
                    wake_up.set_poll_required();
                }
                true
            } else {
                false
            }
        };
        if deferred {
            tracing::debug!(node_id = value.node_id, "poll deferred until wake-up");
            return;
        }
        tracing::debug!(%value, queued = self.queues.len(MsgQueue::Poll), "polling");
        self.enqueue_item(
            MsgQueue::Poll,
            QueueItem::Send(basic::Basic::request_value(value.node_id)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::event_loop::Transaction;
    use super::*;
    use crate::command_class::basic::Basic;
    use crate::command_class::wake_up::WakeUp;
    use zwire_serial::MockPort;

    fn test_driver() -> Driver {
        Driver::new(Arc::new(MockPort::new()), DriverOptions::default())
    }

    fn sleeper(id: u8) -> Node {
        let mut node = Node::new(id);
        node.update_protocol_info(&[0x00, 0x00, 0x00, 0x04, 0x10, 0x01]);
        node.update_node_info(&[0x20, 0x84]);
        node
    }

    fn awake_sleeper(id: u8) -> Node {
        let mut node = sleeper(id);
        node.wake_up_mut().unwrap().set_awake(true);
        node
    }

    #[test]
    fn enqueue_parks_items_for_sleeping_targets() {
        let driver = test_driver();
        driver.inner.nodes.lock().unwrap().insert(sleeper(7));

        driver.send_msg(Basic::set_value(7, 0xff), MsgQueue::Send);
        driver.send_msg(Basic::set_value(7, 0x00), MsgQueue::Send);
        driver.inner.enqueue_item(
            MsgQueue::Query,
            QueueItem::QueryStageComplete {
                node_id: 7,
                stage: QueryStage::Dynamic,
            },
        );

        // Nothing reaches a scheduler queue; every signal stays clear.
        for queue in MsgQueue::ALL {
            assert!(!driver.inner.queues.signal_set(queue));
            assert_eq!(driver.inner.queues.len(queue), 0);
        }
        let mut nodes = driver.inner.nodes.lock().unwrap();
        let buffered = nodes.get_mut(7).unwrap().wake_up_mut().unwrap().pending_len();
        assert_eq!(buffered, 3);
    }

    #[test]
    fn awake_targets_enqueue_normally() {
        let driver = test_driver();
        driver.inner.nodes.lock().unwrap().insert(awake_sleeper(7));

        driver.send_msg(Basic::set_value(7, 0xff), MsgQueue::Send);
        assert!(driver.inner.queues.signal_set(MsgQueue::Send));
        assert_eq!(driver.inner.queues.len(MsgQueue::Send), 1);
    }

    #[test]
    fn wake_delivery_preserves_order_and_appends_goodbye() {
        let driver = test_driver();
        driver.inner.nodes.lock().unwrap().insert(sleeper(7));
        driver.send_msg(Basic::set_value(7, 0x01), MsgQueue::Send);
        driver.send_msg(Basic::set_value(7, 0x02), MsgQueue::Send);

        driver.inner.deliver_wake_up_queue(7);

        assert!(driver.inner.queues.signal_set(MsgQueue::WakeUp));
        assert_eq!(driver.inner.queues.len(MsgQueue::WakeUp), 3);

        let first = driver.inner.queues.pop(MsgQueue::WakeUp).unwrap();
        let second = driver.inner.queues.pop(MsgQueue::WakeUp).unwrap();
        let third = driver.inner.queues.pop(MsgQueue::WakeUp).unwrap();
        for item in [&first, &second, &third] {
            assert_eq!(item.target_node_id(), 7);
        }
        let QueueItem::Send(goodbye) = third else {
            panic!("goodbye must be a message");
        };
        assert!(goodbye.is_wake_up_no_more_information());
    }

    #[test]
    fn move_messages_sweeps_queues_and_the_current_message() {
        let driver = test_driver();
        driver.inner.nodes.lock().unwrap().insert(awake_sleeper(7));
        let mut other = Node::new(3);
        other.update_protocol_info(&[0xc0, 0x00, 0x00, 0x04, 0x10, 0x01]);
        driver.inner.nodes.lock().unwrap().insert(other);

        driver.send_msg(Basic::set_value(7, 0x01), MsgQueue::Send);
        driver.send_msg(Basic::set_value(3, 0x01), MsgQueue::Send);
        driver.send_msg(Basic::request_value(7), MsgQueue::Poll);

        let mut txn = Transaction::new();
        let mut current = Basic::set_value(7, 0x63);
        current.finalize(0x21).unwrap();
        txn.current = Some(current);
        txn.waiting_for_ack = true;
        txn.expected_callback_id = 0x21;

        assert!(driver.inner.move_messages_to_wake_up_queue(&mut txn, 7));

        assert!(txn.current.is_none());
        assert!(!txn.live());
        assert_eq!(driver.inner.queues.len(MsgQueue::Send), 1);
        assert_eq!(driver.inner.queues.len(MsgQueue::Poll), 0);
        assert!(!driver.inner.queues.signal_set(MsgQueue::Poll));

        let mut nodes = driver.inner.nodes.lock().unwrap();
        let node = nodes.get_mut(7).unwrap();
        assert!(node.is_asleep());
        assert_eq!(node.wake_up_mut().unwrap().pending_len(), 3);
    }

    #[test]
    fn move_messages_refuses_listening_targets() {
        let driver = test_driver();
        let mut node = Node::new(4);
        node.update_protocol_info(&[0xc0, 0x00, 0x00, 0x04, 0x10, 0x01]);
        node.update_node_info(&[0x20, 0x84]);
        driver.inner.nodes.lock().unwrap().insert(node);

        let mut txn = Transaction::new();
        assert!(!driver.inner.move_messages_to_wake_up_queue(&mut txn, 4));
    }

    #[test]
    fn no_more_information_is_dropped_on_redirect() {
        let driver = test_driver();
        driver.inner.nodes.lock().unwrap().insert(awake_sleeper(7));

        let mut txn = Transaction::new();
        let mut goodbye = WakeUp::no_more_information(7);
        goodbye.finalize(0x31).unwrap();
        txn.current = Some(goodbye);
        txn.waiting_for_ack = true;
        txn.expected_callback_id = 0x31;

        assert!(driver.inner.move_messages_to_wake_up_queue(&mut txn, 7));
        assert!(txn.current.is_none());

        let mut nodes = driver.inner.nodes.lock().unwrap();
        let buffered = nodes.get_mut(7).unwrap().wake_up_mut().unwrap().pending_len();
        assert_eq!(buffered, 0, "the goodbye must never be parked");
    }

    #[test]
    fn callback_ids_wrap_and_never_hit_zero() {
        let driver = test_driver();
        assert_eq!(driver.inner.next_callback_id(), 1);
        assert_eq!(driver.inner.next_callback_id(), 2);

        driver
            .inner
            .next_callback_id
            .store(255, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(driver.inner.next_callback_id(), 1);
    }

    #[test]
    fn completed_node_scan_fires_each_notification_once() {
        let driver = test_driver();
        driver.inner.info.lock().unwrap().home_id = 0x1234;

        let mut listening = Node::new(2);
        listening.update_protocol_info(&[0xc0, 0x00, 0x00, 0x04, 0x10, 0x01]);
        listening.set_query_stage(QueryStage::Complete);
        driver.inner.nodes.lock().unwrap().insert(listening);
        driver.inner.nodes.lock().unwrap().insert(sleeper(7));

        let mut rx = driver.subscribe();

        // Awake nodes done, the sleeper still pending: AwakeNodesQueried.
        driver.inner.check_completed_node_queries();
        driver.inner.check_completed_node_queries();
        driver.inner.bus.drain();
        assert_eq!(rx.try_recv().unwrap(), Notification::AwakeNodesQueried { home_id: 0x1234 });
        assert!(rx.try_recv().is_err(), "must fire exactly once");

        // Sleeper finishes too: AllNodesQueried, once.
        driver
            .inner
            .nodes
            .lock()
            .unwrap()
            .get_mut(7)
            .unwrap()
            .set_query_stage(QueryStage::Complete);
        driver.inner.check_completed_node_queries();
        driver.inner.check_completed_node_queries();
        driver.inner.bus.drain();
        assert_eq!(rx.try_recv().unwrap(), Notification::AllNodesQueried { home_id: 0x1234 });
        assert!(rx.try_recv().is_err(), "must fire exactly once");
    }
}
