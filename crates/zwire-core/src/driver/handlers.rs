//! Inbound frame dispatch.
//!
//! A verified frame body is `[type, function, payload...]`. RESPONSE frames
//! answer the most recent request; REQUEST frames are callbacks and
//! unsolicited traffic. After the per-function handler runs, the generic
//! expectation matcher decides whether the in-flight transaction is done -
//! except where the handler claimed the frame entirely (SEND_DATA responses,
//! application updates that removed the current message).

use std::sync::atomic::Ordering;

use crate::node::QueryStage;
use crate::notification::Notification;
use crate::protocol::{func, transmit_complete, update_state, NUM_NODE_BITFIELD_BYTES, REQUEST, RESPONSE};
use crate::queue::MsgQueue;
use crate::stats::Counters;
use crate::value::ValueId;
use crate::MAX_TRIES;

use super::event_loop::Transaction;
use super::DriverInner;

impl DriverInner {
    /// Route one verified frame.
    pub(crate) fn process_frame(&self, txn: &mut Transaction, data: &[u8]) {
        if data.len() < 2 {
            tracing::warn!("runt frame, ignoring");
            return;
        }

        let mut handle_callback = true;

        if data[0] == RESPONSE {
            match data[1] {
                func::SERIAL_API_GET_INIT_DATA => self.handle_get_init_data_response(data),
                func::ZW_GET_CONTROLLER_CAPABILITIES => {
                    self.handle_get_controller_capabilities_response(data)
                }
                func::SERIAL_API_GET_CAPABILITIES => {
                    self.handle_get_serial_api_capabilities_response(data)
                }
                func::ZW_SEND_DATA => {
                    self.handle_send_data_response(data, false);
                    // The SEND_DATA request callback closes the transaction.
                    handle_callback = false;
                }
                func::ZW_REPLICATION_SEND_DATA => {
                    self.handle_send_data_response(data, true);
                    handle_callback = false;
                }
                func::ZW_GET_VERSION => self.handle_get_version_response(data),
                func::ZW_MEMORY_GET_ID => self.handle_memory_get_id_response(data),
                func::ZW_GET_NODE_PROTOCOL_INFO => {
                    self.handle_get_node_protocol_info_response(txn, data)
                }
                func::ZW_ASSIGN_RETURN_ROUTE => {
                    if !self.handle_return_route_response(data, "assign return route") {
                        Self::force_callback_close(txn, data);
                    }
                }
                func::ZW_DELETE_RETURN_ROUTE => {
                    if !self.handle_return_route_response(data, "delete return route") {
                        Self::force_callback_close(txn, data);
                    }
                }
                func::ZW_ENABLE_SUC => tracing::info!("reply to enable SUC"),
                func::ZW_REQUEST_NETWORK_UPDATE => {
                    if !self.handle_network_update_response(data) {
                        Self::force_callback_close(txn, data);
                    }
                }
                func::ZW_SET_SUC_NODE_ID => tracing::info!("reply to set SUC node id"),
                func::ZW_GET_SUC_NODE_ID => self.handle_get_suc_node_id_response(data),
                func::ZW_REQUEST_NODE_INFO => {
                    if data.len() > 2 && data[2] != 0 {
                        tracing::debug!("node info request accepted");
                    } else {
                        tracing::info!("node info request failed");
                    }
                }
                func::ZW_REMOVE_FAILED_NODE_ID => {
                    if !self.handle_remove_failed_node_response(data) {
                        Self::force_callback_close(txn, data);
                    }
                }
                func::ZW_IS_FAILED_NODE_ID => self.handle_is_failed_node_response(data),
                func::ZW_REPLACE_FAILED_NODE => {
                    if !self.handle_replace_failed_node_response(data) {
                        Self::force_callback_close(txn, data);
                    }
                }
                func::ZW_GET_ROUTING_INFO => self.handle_get_routing_info_response(txn, data),
                func::ZW_GET_VIRTUAL_NODES => self.handle_get_virtual_nodes_response(data),
                func::SERIAL_API_SET_TIMEOUTS => tracing::info!("reply to set serial api timeouts"),
                func::ZW_R_F_POWER_LEVEL_SET => tracing::info!("reply to RF power level set"),
                func::MEMORY_GET_BYTE => tracing::info!("reply to memory get byte"),
                other => {
                    tracing::info!(
                        function = format_args!("0x{other:02x}"),
                        "no handler for this response"
                    );
                }
            }
        } else if data[0] == REQUEST {
            match data[1] {
                func::APPLICATION_COMMAND_HANDLER => self.handle_application_command(data),
                func::ZW_SEND_DATA => {
                    handle_callback = !self.handle_send_data_request(txn, data, false);
                }
                func::ZW_REPLICATION_SEND_DATA => {
                    handle_callback = !self.handle_send_data_request(txn, data, true);
                }
                func::ZW_APPLICATION_UPDATE => {
                    handle_callback = !self.handle_application_update_request(txn, data);
                }
                func::ZW_ADD_NODE_TO_NETWORK => {
                    self.handle_add_node_status_request(data, /* adding */ true)
                }
                func::ZW_REMOVE_NODE_FROM_NETWORK => {
                    self.handle_add_node_status_request(data, /* adding */ false)
                }
                func::ZW_CREATE_NEW_PRIMARY => self.handle_learn_status_request(data, "create new primary"),
                func::ZW_CONTROLLER_CHANGE => self.handle_learn_status_request(data, "controller change"),
                func::ZW_SET_LEARN_MODE => self.handle_set_learn_mode_request(data),
                func::ZW_REQUEST_NETWORK_UPDATE => self.handle_network_update_request(data),
                func::ZW_REMOVE_FAILED_NODE_ID => self.handle_remove_failed_node_request(data),
                func::ZW_REPLACE_FAILED_NODE => self.handle_replace_failed_node_request(data),
                func::ZW_ASSIGN_RETURN_ROUTE => {
                    self.handle_return_route_request(data, "assign return route")
                }
                func::ZW_DELETE_RETURN_ROUTE => {
                    self.handle_return_route_request(data, "delete return route")
                }
                func::ZW_REQUEST_NODE_NEIGHBOR_UPDATE => {
                    self.handle_neighbor_update_request(data)
                }
                func::APPLICATION_SLAVE_COMMAND_HANDLER => {
                    self.handle_application_slave_command(data)
                }
                func::PROMISCUOUS_APPLICATION_COMMAND_HANDLER => {
                    tracing::debug!("promiscuous application command ignored");
                }
                other => {
                    tracing::debug!(
                        function = format_args!("0x{other:02x}"),
                        "no handler for this request"
                    );
                }
            }
        } else {
            tracing::warn!(frame_type = data[0], "unknown frame type, ignoring");
            return;
        }

        if data[1] != func::APPLICATION_COMMAND_HANDLER {
            Counters::bump(&self.stats.controller_read_cnt);
        }

        if handle_callback {
            self.handle_expectations(txn, data);
        }
    }

    /// The response said the callback will never come; complete the
    /// transaction as if it had.
    fn force_callback_close(txn: &mut Transaction, data: &[u8]) {
        if data.len() > 2 {
            txn.expected_callback_id = data[2];
        }
        txn.expected_reply = 0;
        txn.expected_command_class_id = 0;
        txn.expected_node_id = 0;
    }

    // -----------------------------------------------------------------------
    // Handshake responses
    // -----------------------------------------------------------------------

    fn handle_get_version_response(&self, data: &[u8]) {
        let text = &data[2..];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let version = String::from_utf8_lossy(&text[..end]).into_owned();
        let library_type = text.get(end + 1).copied().unwrap_or(0);
        tracing::info!(%version, library_type, "controller library");
        let mut info = self.info.lock().unwrap();
        info.library_version = version;
        info.library_type = library_type;
    }

    fn handle_memory_get_id_response(&self, data: &[u8]) {
        if data.len() < 7 {
            return;
        }
        let home_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let node_id = data[6];
        tracing::info!(
            home_id = format_args!("0x{home_id:08x}"),
            node_id,
            "controller identity"
        );
        let mut info = self.info.lock().unwrap();
        info.home_id = home_id;
        info.node_id = node_id;
    }

    fn handle_get_controller_capabilities_response(&self, data: &[u8]) {
        use crate::protocol::controller_caps as caps;
        if data.len() < 3 {
            return;
        }
        let capabilities = data[2];
        self.info.lock().unwrap().controller_capabilities = capabilities;
        tracing::info!(
            secondary = capabilities & caps::SECONDARY != 0,
            sis = capabilities & caps::SIS != 0,
            suc = capabilities & caps::SUC != 0,
            on_other_network = capabilities & caps::ON_OTHER_NETWORK != 0,
            "controller capabilities"
        );
    }

    fn handle_get_serial_api_capabilities_response(&self, data: &[u8]) {
        if data.len() < 42 {
            tracing::warn!("short serial api capabilities response");
            return;
        }
        let is_bridge = {
            let mut info = self.info.lock().unwrap();
            info.manufacturer_id = u16::from_be_bytes([data[4], data[5]]);
            info.product_type = u16::from_be_bytes([data[6], data[7]]);
            info.product_id = u16::from_be_bytes([data[8], data[9]]);
            info.api_mask.copy_from_slice(&data[10..42]);
            tracing::info!(
                application = format_args!("{}.{}", data[2], data[3]),
                manufacturer = format_args!("0x{:04x}", info.manufacturer_id),
                product = format_args!("0x{:04x}/0x{:04x}", info.product_type, info.product_id),
                "serial api capabilities"
            );
            info.is_bridge()
        };

        if is_bridge {
            let mut msg = crate::protocol::message::Message::new(
                func::name(func::ZW_GET_VIRTUAL_NODES),
                crate::protocol::CONTROLLER_NODE_ID,
                REQUEST,
                func::ZW_GET_VIRTUAL_NODES,
                false,
            );
            msg.expect_reply(func::ZW_GET_VIRTUAL_NODES);
            self.enqueue_item(MsgQueue::Command, crate::queue::QueueItem::Send(msg));
        }
        let mut msg = crate::protocol::message::Message::new(
            func::name(func::SERIAL_API_GET_INIT_DATA),
            crate::protocol::CONTROLLER_NODE_ID,
            REQUEST,
            func::SERIAL_API_GET_INIT_DATA,
            false,
        );
        msg.expect_reply(func::SERIAL_API_GET_INIT_DATA);
        self.enqueue_item(MsgQueue::Command, crate::queue::QueueItem::Send(msg));
    }

    fn handle_get_suc_node_id_response(&self, data: &[u8]) {
        if data.len() < 3 {
            return;
        }
        self.info.lock().unwrap().suc_node_id = data[2];
        if data[2] == 0 {
            tracing::info!("no SUC in this network");
        } else {
            tracing::info!(suc_node_id = data[2], "SUC present");
        }
    }

    fn handle_get_virtual_nodes_response(&self, data: &[u8]) {
        if data.len() < 2 + NUM_NODE_BITFIELD_BYTES {
            tracing::warn!("short virtual nodes response");
            return;
        }
        let mut info = self.info.lock().unwrap();
        info.virtual_nodes
            .copy_from_slice(&data[2..2 + NUM_NODE_BITFIELD_BYTES]);
        info.virtual_nodes_received = true;
        tracing::info!("virtual node list received");
    }

    // -----------------------------------------------------------------------
    // Init data reconciliation
    // -----------------------------------------------------------------------

    fn handle_get_init_data_response(&self, data: &[u8]) {
        if data.len() < 5 {
            return;
        }
        let first = !self.init.swap(true, Ordering::SeqCst);
        let home_id = {
            let mut info = self.info.lock().unwrap();
            info.init_version = data[2];
            info.api_capabilities = data[3];
            info.home_id
        };

        if first {
            // Watchers need the driver marked ready before the node events
            // that follow.
            let node_id = self.info.lock().unwrap().node_id;
            self.bus.queue(Notification::DriverReady { home_id, node_id });
            self.load_snapshot();
        }

        if usize::from(data[4]) != NUM_NODE_BITFIELD_BYTES
            || data.len() < 5 + NUM_NODE_BITFIELD_BYTES
        {
            tracing::warn!(len = data[4], "unexpected init-data bitmap length");
            return;
        }
        let bitmap = &data[5..5 + NUM_NODE_BITFIELD_BYTES];

        for i in 0..NUM_NODE_BITFIELD_BYTES {
            for j in 0..8 {
                let node_id = (i * 8 + j + 1) as u8;
                let present = bitmap[i] & (1 << j) != 0;
                if present {
                    if self.info.lock().unwrap().is_virtual_node(node_id) {
                        tracing::info!(node_id, "virtual node, ignored");
                        continue;
                    }
                    let known = self.nodes.lock().unwrap().get(node_id).is_some();
                    if known {
                        tracing::info!(node_id, "known node");
                        if first {
                            self.reset_loaded_node(node_id);
                        }
                    } else {
                        tracing::info!(node_id, "new node");
                        self.bus.queue(Notification::NodeNew { home_id, node_id });
                        self.init_node(node_id);
                    }
                } else if self.unlink_node(node_id) {
                    tracing::info!(node_id, "node no longer in the network");
                }
            }
        }

        self.check_completed_node_queries();
    }

    /// Snapshot-loaded nodes re-run from Associations (configurable) so
    /// session-ephemeral data is refreshed.
    fn reset_loaded_node(&self, node_id: u8) {
        use crate::config::QueryStageReset;
        match self.options.query_stage_reset {
            QueryStageReset::Associations => {
                let actions = {
                    let mut nodes = self.nodes.lock().unwrap();
                    let Some(node) = nodes.get_mut(node_id) else {
                        return;
                    };
                    node.set_query_stage(QueryStage::Associations);
                    node.advance_queries()
                };
                self.perform_query_actions(node_id, actions);
            }
            QueryStageReset::Preserve => {}
        }
    }

    // -----------------------------------------------------------------------
    // Node responses
    // -----------------------------------------------------------------------

    fn handle_get_node_protocol_info_response(&self, txn: &mut Transaction, data: &[u8]) {
        // The response does not name the node; it answers the most recent
        // request.
        let Some(msg) = txn.current.as_ref() else {
            tracing::warn!("unexpected protocol info response, ignoring");
            return;
        };
        let node_id = msg.target_node_id();
        tracing::info!(node_id, "protocol info response");
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_id) {
            node.update_protocol_info(&data[2..]);
        }
    }

    fn handle_get_routing_info_response(&self, txn: &mut Transaction, data: &[u8]) {
        let Some(msg) = txn.current.as_ref() else {
            tracing::warn!("unexpected routing info response, ignoring");
            return;
        };
        let node_id = msg.target_node_id();
        if data.len() < 2 + NUM_NODE_BITFIELD_BYTES {
            tracing::warn!(node_id, "short routing info response");
            return;
        }
        tracing::info!(node_id, "neighbour table received");
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_id) {
            node.update_neighbours(&data[2..2 + NUM_NODE_BITFIELD_BYTES]);
        }
    }

    // -----------------------------------------------------------------------
    // SEND_DATA
    // -----------------------------------------------------------------------

    fn handle_send_data_response(&self, data: &[u8], replication: bool) {
        let name = if replication { "REPLICATION_SEND_DATA" } else { "SEND_DATA" };
        if data.len() > 2 && data[2] != 0 {
            tracing::debug!("{name} accepted by the controller");
        } else {
            tracing::info!("{name} rejected by the controller");
        }
    }

    /// Returns true when the frame is fully claimed here and the generic
    /// matcher must not run (failure outcomes keep the transaction live so
    /// the retry timer, or the drop, already decided its fate).
    fn handle_send_data_request(&self, txn: &mut Transaction, data: &[u8], replication: bool) -> bool {
        let name = if replication { "REPLICATION_SEND_DATA" } else { "SEND_DATA" };
        if data.len() < 4 {
            return true;
        }
        tracing::debug!(
            callback = format_args!("0x{:02x}", data[2]),
            expected = format_args!("0x{:02x}", txn.expected_callback_id),
            "{name} callback"
        );

        if data[2] != txn.expected_callback_id {
            tracing::info!("callback id is invalid, ignoring");
            return true;
        }

        let status = data[3];
        if status & transmit_complete::NO_ROUTE != 0 {
            tracing::error!("{name} failed: no route available");
            Counters::bump(&self.stats.dropped);
            txn.clear();
            true
        } else if status & transmit_complete::NO_ACK != 0 {
            tracing::error!("{name} failed: no ACK, device may be asleep");
            if !replication {
                if let Some(target) = txn.current.as_ref().map(|m| m.target_node_id()) {
                    if self.move_messages_to_wake_up_queue(txn, target) {
                        return true;
                    }
                    tracing::info!("not a sleeping device, the retry timer will resend");
                }
            }
            true
        } else if status & transmit_complete::FAIL != 0 {
            // Soft failure; the normal retry path resends.
            tracing::error!("{name} failed: network busy");
            true
        } else {
            // Delivered and acknowledged by the target; the generic matcher
            // clears the expected reply and completes the transaction.
            txn.expected_callback_id = 0;
            false
        }
    }

    // -----------------------------------------------------------------------
    // Application traffic
    // -----------------------------------------------------------------------

    fn handle_application_command(&self, data: &[u8]) {
        if data.len() < 7 {
            tracing::warn!("runt application command");
            return;
        }
        let node_id = data[3];
        let length = usize::from(data[4]);
        let class_id = data[5];
        if length < 2 {
            tracing::warn!(node_id, "application command with no command byte");
            return;
        }
        let end = (5 + length).min(data.len());
        let class_payload = &data[6..end];

        let events = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get_mut(node_id) {
                Some(node) => node.application_command(class_id, class_payload),
                None => {
                    tracing::debug!(node_id, "application command from unknown node");
                    return;
                }
            }
        };
        self.apply_class_events(node_id, events);
    }

    /// Returns true when the current message was removed (expectations are
    /// already cleared and the generic matcher must not run).
    fn handle_application_update_request(&self, txn: &mut Transaction, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }
        let node_id = data[3];
        let home_id = self.info.lock().unwrap().home_id;

        match data[2] {
            update_state::SUC_ID => {
                tracing::info!(node_id, "SUC id update");
                false
            }
            update_state::DELETE_DONE => {
                tracing::info!(node_id, "network change: node removed");
                self.unlink_node(node_id);
                false
            }
            update_state::NEW_ID_ASSIGNED => {
                tracing::info!(node_id, "network change: new node assigned");
                self.init_node(node_id);
                false
            }
            update_state::ROUTING_PENDING => {
                tracing::debug!(node_id, "routing pending");
                false
            }
            update_state::NODE_INFO_REQ_FAILED => {
                tracing::warn!("node info request failed");
                // The frame carries node id 0 here; the target of the
                // in-flight request is the node that went quiet.
                let Some(target) = txn.current.as_ref().map(|m| m.target_node_id()) else {
                    return false;
                };
                {
                    let mut nodes = self.nodes.lock().unwrap();
                    if let Some(node) = nodes.get_mut(target) {
                        node.query_stage_retry(QueryStage::NodeInfo, MAX_TRIES);
                    }
                }
                // The silence may just be sleep.
                if self.move_messages_to_wake_up_queue(txn, target) {
                    txn.clear();
                    return true;
                }
                false
            }
            update_state::NODE_INFO_REQ_DONE => {
                tracing::debug!(node_id, "node info request done");
                false
            }
            update_state::NODE_INFO_RECEIVED => {
                tracing::info!(node_id, "node info received");
                if data.len() < 8 {
                    return false;
                }
                let class_count = usize::from(data[4]).saturating_sub(3);
                let end = (8 + class_count).min(data.len());
                let added = {
                    let mut nodes = self.nodes.lock().unwrap();
                    match nodes.get_mut(node_id) {
                        Some(node) => node.update_node_info(&data[8..end]),
                        None => Vec::new(),
                    }
                };
                for class_id in added {
                    self.bus
                        .queue(Notification::ValueAdded(ValueId::new(home_id, node_id, class_id)));
                }
                false
            }
            other => {
                tracing::debug!(state = format_args!("0x{other:02x}"), "unhandled application update");
                false
            }
        }
    }

    /// Basic SET on a virtual node maps to a bridge button press.
    fn handle_application_slave_command(&self, data: &[u8]) {
        use crate::command_class::basic;
        if data.len() < 9 {
            return;
        }
        let dest = data[4];
        let class_id = data[6];
        let command = data[7];
        let value = data[8];
        if class_id != basic::CLASS_ID || command != basic::SET {
            return;
        }

        let buttons = self.buttons.lock().unwrap();
        for (&node_id, map) in &buttons.buttons {
            for (&button_id, &virtual_node) in map {
                if virtual_node == dest {
                    let notification = if value != 0 {
                        Notification::ButtonOn { node_id, button_id }
                    } else {
                        Notification::ButtonOff { node_id, button_id }
                    };
                    self.bus.queue(notification);
                    return;
                }
            }
        }
        tracing::debug!(dest, "slave command for an unmapped virtual node");
    }
}
