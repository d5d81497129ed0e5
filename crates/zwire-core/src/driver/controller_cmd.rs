//! The network-management command state machine.
//!
//! One command runs at a time (include, exclude, failed-node handling,
//! return routes, topology updates). Progress flows to the caller through a
//! `watch` channel; callbacks for these function ids route here instead of
//! to a node. Cancellation sends the protocol-specific stop frame where the
//! command has one.

use tokio::sync::watch;

use crate::error::DriverError;
use crate::notification::Notification;
use crate::protocol::message::Message;
use crate::protocol::{
    add_node, controller_change, create_primary, failed_node, func, learn_mode, neighbor_update,
    remove_node, suc_update, CONTROLLER_NODE_ID, REQUEST,
};
use crate::queue::{MsgQueue, QueueItem};

use super::DriverInner;

/// Network-management commands the controller can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Include a new controller
    AddController,
    /// Include a new device
    AddDevice,
    /// Make this controller the new primary
    CreateNewPrimary,
    /// Receive network configuration from another controller
    ReceiveConfiguration,
    /// Exclude a controller
    RemoveController,
    /// Exclude a device
    RemoveDevice,
    /// Ask whether the protocol considers a node failed
    HasNodeFailed,
    /// Drop a failed node from the protocol's tables
    RemoveFailedNode,
    /// Replace a failed node with a new device under the same id
    ReplaceFailedNode,
    /// Hand the primary role to another controller
    TransferPrimaryRole,
    /// Ask the SUC for a topology update
    RequestNetworkUpdate,
    /// Ask a node to rediscover its neighbours
    RequestNodeNeighborUpdate,
    /// Assign a return route from a node to the controller
    AssignReturnRoute,
    /// Delete all return routes from a node
    DeleteAllReturnRoutes,
    /// Create a virtual-node button (bridge controllers)
    CreateButton,
    /// Delete a virtual-node button (bridge controllers)
    DeleteButton,
}

/// Progress of the active command as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No command running
    Normal,
    /// Command accepted, waiting for user action (button press on the
    /// device)
    Waiting,
    /// The protocol is exchanging frames for the command
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Cancelled by the host
    Cancel,
    /// HasNodeFailed verdict: the node is responsive
    NodeOk,
    /// HasNodeFailed verdict: the protocol considers the node failed
    NodeFailed,
}

/// The active command, if any, and its progress channel.
#[derive(Default)]
pub(crate) struct CommandSession {
    pub command: Option<ControllerCommand>,
    pub node_id: u8,
    state_tx: Option<watch::Sender<ControllerState>>,
}

impl CommandSession {
    fn set_state(&self, state: ControllerState) {
        if let Some(tx) = &self.state_tx {
            let _ = tx.send(state);
        }
    }
}

impl DriverInner {
    pub(crate) fn begin_controller_command(
        &self,
        command: ControllerCommand,
        node_id: u8,
        high_power: bool,
    ) -> Result<watch::Receiver<ControllerState>, DriverError> {
        let rx = {
            let mut session = self.command.lock().unwrap();
            if let Some(active) = session.command {
                return Err(DriverError::ControllerBusy(active));
            }
            let (tx, rx) = watch::channel(ControllerState::Normal);
            session.command = Some(command);
            session.node_id = node_id;
            session.state_tx = Some(tx);
            rx
        };

        tracing::info!(?command, node_id, "controller command starting");

        let power = if high_power { add_node::OPTION_HIGH_POWER } else { 0 };
        match command {
            ControllerCommand::AddController => {
                let mut msg = self.command_msg("add controller", func::ZW_ADD_NODE_TO_NETWORK);
                msg.append(add_node::CONTROLLER | power);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::AddDevice => {
                let mut msg = self.command_msg("add device", func::ZW_ADD_NODE_TO_NETWORK);
                msg.append(add_node::SLAVE | power);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::CreateNewPrimary => {
                let mut msg = self.command_msg("create new primary", func::ZW_CREATE_NEW_PRIMARY);
                msg.append(create_primary::START);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::ReceiveConfiguration => {
                let mut msg = self.command_msg("receive configuration", func::ZW_SET_LEARN_MODE);
                msg.append(0xff);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::RemoveController | ControllerCommand::RemoveDevice => {
                let mut msg = self.command_msg("remove node", func::ZW_REMOVE_NODE_FROM_NETWORK);
                msg.append(remove_node::ANY | power);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::HasNodeFailed => {
                let mut msg = Message::new(
                    "has node failed",
                    CONTROLLER_NODE_ID,
                    REQUEST,
                    func::ZW_IS_FAILED_NODE_ID,
                    false,
                );
                msg.append(node_id);
                msg.expect_reply(func::ZW_IS_FAILED_NODE_ID);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::RemoveFailedNode => {
                let mut msg = self.command_msg("remove failed node", func::ZW_REMOVE_FAILED_NODE_ID);
                msg.append(node_id);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::ReplaceFailedNode => {
                let mut msg = self.command_msg("replace failed node", func::ZW_REPLACE_FAILED_NODE);
                msg.append(node_id);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::TransferPrimaryRole => {
                let mut msg = self.command_msg("transfer primary role", func::ZW_CONTROLLER_CHANGE);
                msg.append(controller_change::START);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::RequestNetworkUpdate => {
                let msg = self.command_msg("request network update", func::ZW_REQUEST_NETWORK_UPDATE);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::RequestNodeNeighborUpdate => {
                let mut msg = Message::new(
                    "request neighbor update",
                    node_id,
                    REQUEST,
                    func::ZW_REQUEST_NODE_NEIGHBOR_UPDATE,
                    true,
                );
                msg.append(node_id);
                msg.expect_reply(func::ZW_REQUEST_NODE_NEIGHBOR_UPDATE);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::AssignReturnRoute => {
                let controller = self.info.lock().unwrap().node_id;
                let mut msg = Message::new(
                    "assign return route",
                    node_id,
                    REQUEST,
                    func::ZW_ASSIGN_RETURN_ROUTE,
                    true,
                );
                msg.append(node_id);
                msg.append(controller);
                msg.expect_reply(func::ZW_ASSIGN_RETURN_ROUTE);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::DeleteAllReturnRoutes => {
                let mut msg = Message::new(
                    "delete return routes",
                    node_id,
                    REQUEST,
                    func::ZW_DELETE_RETURN_ROUTE,
                    true,
                );
                msg.append(node_id);
                msg.expect_reply(func::ZW_DELETE_RETURN_ROUTE);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::CreateButton => {
                return self.create_button(node_id);
            }
            ControllerCommand::DeleteButton => {
                return self.delete_button(node_id);
            }
        }

        Ok(rx)
    }

    fn command_msg(&self, description: &'static str, function: u8) -> Message {
        let mut msg = Message::new(description, CONTROLLER_NODE_ID, REQUEST, function, true);
        msg.expect_reply(function);
        msg
    }

    pub(crate) fn cancel_controller_command(&self) -> bool {
        let mut session = self.command.lock().unwrap();
        let Some(command) = session.command else {
            return false;
        };

        match command {
            ControllerCommand::AddController | ControllerCommand::AddDevice => {
                session.node_id = CONTROLLER_NODE_ID; // nothing new to initialise
                let mut msg = self.command_msg("cancel add node", func::ZW_ADD_NODE_TO_NETWORK);
                msg.append(add_node::STOP);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::CreateNewPrimary => {
                let mut msg = self.command_msg("cancel create new primary", func::ZW_CREATE_NEW_PRIMARY);
                msg.append(create_primary::STOP);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::ReceiveConfiguration => {
                let mut msg = Message::new(
                    "cancel receive configuration",
                    CONTROLLER_NODE_ID,
                    REQUEST,
                    func::ZW_SET_LEARN_MODE,
                    false,
                );
                msg.append(0);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::RemoveController | ControllerCommand::RemoveDevice => {
                let mut msg = self.command_msg("cancel remove node", func::ZW_REMOVE_NODE_FROM_NETWORK);
                msg.append(remove_node::STOP);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::TransferPrimaryRole => {
                let mut msg = self.command_msg("cancel transfer primary role", func::ZW_CONTROLLER_CHANGE);
                msg.append(controller_change::STOP);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            ControllerCommand::HasNodeFailed
            | ControllerCommand::RemoveFailedNode
            | ControllerCommand::ReplaceFailedNode => {
                // No stop opcode exists for these.
                return false;
            }
            ControllerCommand::CreateButton
            | ControllerCommand::DeleteButton
            | ControllerCommand::RequestNetworkUpdate
            | ControllerCommand::RequestNodeNeighborUpdate
            | ControllerCommand::AssignReturnRoute
            | ControllerCommand::DeleteAllReturnRoutes => {}
        }

        tracing::info!(?command, "controller command cancelled");
        session.set_state(ControllerState::Cancel);
        session.command = None;
        true
    }

    fn end_command(&self, state: ControllerState) {
        let mut session = self.command.lock().unwrap();
        session.set_state(state);
        session.command = None;
    }

    fn set_command_state(&self, state: ControllerState) {
        self.command.lock().unwrap().set_state(state);
    }

    // -----------------------------------------------------------------------
    // Bridge buttons
    // -----------------------------------------------------------------------

    /// Bind the next unmapped virtual node to the next free button id on
    /// `node_id`. Pure table work at this layer; the slave-learn wire dance
    /// happens outside the engine.
    fn create_button(
        &self,
        node_id: u8,
    ) -> Result<watch::Receiver<ControllerState>, DriverError> {
        let result = (|| {
            let info = self.info.lock().unwrap();
            if !info.is_bridge() {
                return Err(DriverError::NotBridgeController);
            }
            let mut buttons = self.buttons.lock().unwrap();
            let button_id = buttons
                .buttons
                .get(&node_id)
                .and_then(|m| m.keys().max().copied())
                .map_or(1, |b| b + 1);
            let virtual_node = (1..=crate::node::MAX_NODES as u8)
                .find(|&candidate| {
                    info.is_virtual_node(candidate)
                        && !buttons
                            .buttons
                            .values()
                            .any(|m| m.values().any(|&v| v == candidate))
                })
                .ok_or(DriverError::NotBridgeController)?;
            buttons.insert(node_id, button_id, virtual_node);
            let _ = buttons.save(&self.options.user_path);
            Ok(button_id)
        })();

        match result {
            Ok(button_id) => {
                self.bus.queue(Notification::ButtonCreate { node_id, button_id });
                self.end_command(ControllerState::Completed);
                let (_tx, rx) = watch::channel(ControllerState::Completed);
                Ok(rx)
            }
            Err(e) => {
                self.end_command(ControllerState::Failed);
                Err(e)
            }
        }
    }

    fn delete_button(
        &self,
        node_id: u8,
    ) -> Result<watch::Receiver<ControllerState>, DriverError> {
        let result = (|| {
            if !self.info.lock().unwrap().is_bridge() {
                return Err(DriverError::NotBridgeController);
            }
            let mut buttons = self.buttons.lock().unwrap();
            let button_id = buttons
                .buttons
                .get(&node_id)
                .and_then(|m| m.keys().max().copied())
                .ok_or(DriverError::UnknownNode(node_id))?;
            buttons.remove(node_id, button_id);
            let _ = buttons.save(&self.options.user_path);
            Ok(button_id)
        })();

        match result {
            Ok(button_id) => {
                self.bus.queue(Notification::ButtonDelete { node_id, button_id });
                self.end_command(ControllerState::Completed);
                let (_tx, rx) = watch::channel(ControllerState::Completed);
                Ok(rx)
            }
            Err(e) => {
                self.end_command(ControllerState::Failed);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Callback handlers (REQUEST frames)
    // -----------------------------------------------------------------------

    /// Common status handling for add-node and remove-node flows.
    pub(crate) fn handle_add_node_status_request(&self, data: &[u8], adding: bool) {
        if data.len() < 4 {
            return;
        }
        let status = data[3];
        let flow = if adding { "add node" } else { "remove node" };
        match status {
            add_node::STATUS_LEARN_READY => {
                tracing::info!("{flow}: learn ready, waiting for the device");
                self.set_command_state(ControllerState::Waiting);
            }
            add_node::STATUS_NODE_FOUND => {
                tracing::info!("{flow}: node found");
                self.set_command_state(ControllerState::InProgress);
            }
            add_node::STATUS_ADDING_SLAVE | add_node::STATUS_ADDING_CONTROLLER => {
                let node_id = data.get(4).copied().unwrap_or(0);
                tracing::info!(node_id, "{flow}: exchanging protocol data");
                self.command.lock().unwrap().node_id = node_id;
                self.set_command_state(ControllerState::InProgress);
            }
            add_node::STATUS_PROTOCOL_DONE => {
                // The protocol part is done; tell the chip to stop the flow.
                tracing::info!("{flow}: protocol done, stopping");
                let (function, stop) = if adding {
                    (func::ZW_ADD_NODE_TO_NETWORK, add_node::STOP)
                } else {
                    (func::ZW_REMOVE_NODE_FROM_NETWORK, remove_node::STOP)
                };
                let mut msg = self.command_msg("stop include/exclude", function);
                msg.append(stop);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
            }
            add_node::STATUS_DONE => {
                let node_id = {
                    let session = self.command.lock().unwrap();
                    let from_frame = data.get(4).copied().unwrap_or(0);
                    if from_frame != 0 { from_frame } else { session.node_id }
                };
                tracing::info!(node_id, "{flow}: done");
                if node_id != 0 && node_id != CONTROLLER_NODE_ID {
                    if adding {
                        self.init_node(node_id);
                    } else {
                        self.unlink_node(node_id);
                    }
                }
                self.end_command(ControllerState::Completed);
            }
            add_node::STATUS_FAILED => {
                tracing::warn!("{flow}: failed");
                let (function, stop) = if adding {
                    (func::ZW_ADD_NODE_TO_NETWORK, add_node::STOP_FAILED)
                } else {
                    (func::ZW_REMOVE_NODE_FROM_NETWORK, remove_node::STOP)
                };
                let mut msg = self.command_msg("stop failed include/exclude", function);
                msg.append(stop);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "{flow}: unhandled status");
            }
        }
    }

    /// Create-new-primary and controller-change callbacks share the learn
    /// status codes.
    pub(crate) fn handle_learn_status_request(&self, data: &[u8], flow: &'static str) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            learn_mode::STARTED => {
                tracing::info!("{flow}: started, waiting");
                self.set_command_state(ControllerState::Waiting);
            }
            learn_mode::DONE => {
                tracing::info!("{flow}: done");
                self.end_command(ControllerState::Completed);
            }
            learn_mode::FAILED => {
                tracing::warn!("{flow}: failed");
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "{flow}: status");
                self.set_command_state(ControllerState::InProgress);
            }
        }
    }

    pub(crate) fn handle_set_learn_mode_request(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            learn_mode::STARTED => {
                tracing::info!("learn mode started");
                self.set_command_state(ControllerState::Waiting);
            }
            learn_mode::DONE => {
                tracing::info!("learn mode done");
                self.end_command(ControllerState::Completed);
            }
            learn_mode::FAILED => {
                tracing::warn!("learn mode failed");
                let mut msg = Message::new(
                    "learn mode off",
                    CONTROLLER_NODE_ID,
                    REQUEST,
                    func::ZW_SET_LEARN_MODE,
                    false,
                );
                msg.append(0);
                self.enqueue_item(MsgQueue::Command, QueueItem::Send(msg));
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "learn mode status");
            }
        }
    }

    pub(crate) fn handle_network_update_request(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        let state = match data[3] {
            suc_update::DONE => {
                tracing::info!("network update: success");
                ControllerState::Completed
            }
            suc_update::ABORT => {
                tracing::warn!("network update failed: aborted");
                ControllerState::Failed
            }
            suc_update::WAIT => {
                tracing::warn!("network update failed: SUC busy");
                ControllerState::Failed
            }
            suc_update::DISABLED => {
                tracing::warn!("network update failed: SUC disabled");
                ControllerState::Failed
            }
            suc_update::OVERFLOW => {
                tracing::warn!("network update failed: overflow, full replication required");
                ControllerState::Failed
            }
            _ => ControllerState::Failed,
        };
        self.end_command(state);
    }

    pub(crate) fn handle_remove_failed_node_request(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            failed_node::REMOVED => {
                let node_id = self.command.lock().unwrap().node_id;
                tracing::info!(node_id, "failed node removed");
                self.unlink_node(node_id);
                self.end_command(ControllerState::Completed);
            }
            failed_node::NOT_REMOVED => {
                tracing::warn!("failed node was not removed");
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "remove failed node status");
            }
        }
    }

    pub(crate) fn handle_replace_failed_node_request(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            failed_node::REPLACE_WAITING => {
                tracing::info!("replace failed node: waiting for the new device");
                self.set_command_state(ControllerState::Waiting);
            }
            failed_node::REPLACE_DONE => {
                let node_id = self.command.lock().unwrap().node_id;
                tracing::info!(node_id, "replace failed node: done");
                // The id survives but the hardware is new; interrogate it
                // from scratch.
                self.init_node(node_id);
                self.end_command(ControllerState::Completed);
            }
            failed_node::REPLACE_FAILED => {
                tracing::warn!("replace failed node: failed");
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "replace failed node status");
            }
        }
    }

    pub(crate) fn handle_return_route_request(&self, data: &[u8], flow: &'static str) {
        if data.len() < 4 {
            return;
        }
        if data[3] == 0 {
            tracing::info!("{flow}: success");
            self.end_command(ControllerState::Completed);
        } else {
            tracing::warn!(status = format_args!("0x{:02x}", data[3]), "{flow}: failed");
            self.end_command(ControllerState::Failed);
        }
    }

    pub(crate) fn handle_neighbor_update_request(&self, data: &[u8]) {
        if data.len() < 4 {
            return;
        }
        match data[3] {
            neighbor_update::STARTED => {
                tracing::info!("neighbor update started");
                self.set_command_state(ControllerState::InProgress);
            }
            neighbor_update::DONE => {
                let node_id = self.command.lock().unwrap().node_id;
                tracing::info!(node_id, "neighbor update done");
                // Pull the fresh neighbour table from the chip.
                let mut msg = Message::new(
                    "get routing info",
                    node_id,
                    REQUEST,
                    func::ZW_GET_ROUTING_INFO,
                    false,
                );
                msg.append(node_id);
                msg.expect_reply(func::ZW_GET_ROUTING_INFO);
                self.enqueue_item(MsgQueue::Send, QueueItem::Send(msg));
                self.end_command(ControllerState::Completed);
            }
            neighbor_update::FAILED => {
                tracing::warn!("neighbor update failed");
                self.end_command(ControllerState::Failed);
            }
            other => {
                tracing::debug!(status = format_args!("0x{other:02x}"), "neighbor update status");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Response handlers (RESPONSE frames; false = callback will never come)
    // -----------------------------------------------------------------------

    pub(crate) fn handle_return_route_response(&self, data: &[u8], flow: &'static str) -> bool {
        if data.len() > 2 && data[2] != 0 {
            tracing::info!("{flow}: command in progress");
            self.set_command_state(ControllerState::InProgress);
            true
        } else {
            tracing::warn!("{flow}: command failed");
            self.end_command(ControllerState::Failed);
            false
        }
    }

    pub(crate) fn handle_network_update_response(&self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            tracing::info!("network update: command in progress");
            self.set_command_state(ControllerState::InProgress);
            true
        } else {
            tracing::warn!("network update: command failed");
            self.end_command(ControllerState::Failed);
            false
        }
    }

    pub(crate) fn handle_remove_failed_node_response(&self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            tracing::warn!(
                status = format_args!("0x{:02x}", data[2]),
                "remove failed node rejected"
            );
            self.end_command(ControllerState::Failed);
            false
        } else {
            tracing::info!("remove failed node accepted");
            self.set_command_state(ControllerState::InProgress);
            true
        }
    }

    pub(crate) fn handle_replace_failed_node_response(&self, data: &[u8]) -> bool {
        if data.len() > 2 && data[2] != 0 {
            tracing::warn!(
                status = format_args!("0x{:02x}", data[2]),
                "replace failed node rejected"
            );
            self.end_command(ControllerState::Failed);
            false
        } else {
            tracing::info!("replace failed node accepted");
            self.set_command_state(ControllerState::InProgress);
            true
        }
    }

    pub(crate) fn handle_is_failed_node_response(&self, data: &[u8]) {
        let node_id = self.command.lock().unwrap().node_id;
        let state = if data.len() > 2 && data[2] != 0 {
            tracing::warn!(node_id, "protocol considers the node failed");
            ControllerState::NodeFailed
        } else {
            tracing::info!(node_id, "node is responsive");
            ControllerState::NodeOk
        };
        self.end_command(state);
    }
}
