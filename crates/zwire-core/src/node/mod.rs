//! Node state and the node table.
//!
//! The driver owns a fixed 232-slot arena; everything that inspects or
//! mutates a node does so under the driver's node mutex. Handles across the
//! API boundary are plain node ids validated against the table on each use -
//! no pointers survive a lock release.

mod query;

pub use query::QueryStage;

use std::collections::BTreeMap;

use crate::command_class::{self, wake_up::WakeUp, ClassEvent, CommandClass};
use crate::protocol::message::{send_data, Message};
use crate::protocol::{func, NUM_NODE_BITFIELD_BYTES, REQUEST};

/// Node ids are 1..=232.
pub type NodeId = u8;

/// Highest addressable node id.
pub const MAX_NODES: usize = 232;

/// Basic device class ids that mark a controller-class device.
const BASIC_TYPE_CONTROLLER: u8 = 0x01;
const BASIC_TYPE_STATIC_CONTROLLER: u8 = 0x02;

/// Class-id list terminator in a node info frame: ids after this byte are
/// controlled, not supported.
const CLASS_MARK: u8 = 0xef;

/// What a query-stage advance wants the driver to do, in order.
#[derive(Debug)]
pub enum QueryAction {
    /// Enqueue this interrogation message (Query queue, subject to sleeping
    /// redirection)
    Enqueue(Message),
    /// Enqueue the stage-complete marker behind the stage's messages
    Marker(QueryStage),
}

/// One device on the mesh.
pub struct Node {
    id: NodeId,

    // Protocol flags from the controller's protocol info
    listening: bool,
    frequent_listening: bool,
    routing: bool,
    beaming: bool,
    security: bool,
    basic_class: u8,
    generic_class: u8,
    specific_class: u8,

    // Product identity (ManufacturerSpecific fills these outside the core)
    manufacturer_id: u16,
    product_type: u16,
    product_id: u16,

    name: String,
    location: String,

    neighbours: [u8; NUM_NODE_BITFIELD_BYTES],

    query_stage: QueryStage,
    query_pending: bool,
    query_retries: u8,

    classes: BTreeMap<u8, Box<dyn CommandClass>>,

    read_cnt: u32,
    write_cnt: u32,
}

impl Node {
    /// Create a fresh node at the start of the interrogation pipeline.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            listening: false,
            frequent_listening: false,
            routing: false,
            beaming: false,
            security: false,
            basic_class: 0,
            generic_class: 0,
            specific_class: 0,
            manufacturer_id: 0,
            product_type: 0,
            product_id: 0,
            name: String::new(),
            location: String::new(),
            neighbours: [0; NUM_NODE_BITFIELD_BYTES],
            query_stage: QueryStage::ProtocolInfo,
            query_pending: false,
            query_retries: 0,
            classes: BTreeMap::new(),
            read_cnt: 0,
            write_cnt: 0,
        }
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Always-on receiver.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Low-duty-cycle receiver (beam wake-up).
    pub fn is_frequent_listening(&self) -> bool {
        self.frequent_listening
    }

    /// Device can route for others.
    pub fn is_routing(&self) -> bool {
        self.routing
    }

    /// Device supports beam wake-up of neighbours.
    pub fn is_beaming(&self) -> bool {
        self.beaming
    }

    /// Device supports the security command class.
    pub fn is_security_capable(&self) -> bool {
        self.security
    }

    /// Device is a controller by basic device class.
    pub fn is_controller(&self) -> bool {
        matches!(
            self.basic_class,
            BASIC_TYPE_CONTROLLER | BASIC_TYPE_STATIC_CONTROLLER
        )
    }

    /// Basic/generic/specific device class bytes.
    pub fn device_classes(&self) -> (u8, u8, u8) {
        (self.basic_class, self.generic_class, self.specific_class)
    }

    /// Manufacturer id, product type, product id.
    pub fn product(&self) -> (u16, u16, u16) {
        (self.manufacturer_id, self.product_type, self.product_id)
    }

    /// Human-editable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the human-editable name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Human-editable location.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Set the human-editable location.
    pub fn set_location(&mut self, location: impl Into<String>) {
        self.location = location.into();
    }

    /// Neighbour bitmap (bit 0 of byte 0 = node 1).
    pub fn neighbours(&self) -> &[u8; NUM_NODE_BITFIELD_BYTES] {
        &self.neighbours
    }

    /// True when `other` is in this node's neighbour table.
    pub fn is_neighbour(&self, other: NodeId) -> bool {
        if other < 1 {
            return false;
        }
        let bit = usize::from(other) - 1;
        self.neighbours[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Frames successfully received from this node.
    pub fn read_cnt(&self) -> u32 {
        self.read_cnt
    }

    /// Frames written with this node as the target.
    pub fn write_cnt(&self) -> u32 {
        self.write_cnt
    }

    pub(crate) fn count_write(&mut self) {
        self.write_cnt += 1;
    }

    // -----------------------------------------------------------------------
    // Wire update handlers
    // -----------------------------------------------------------------------

    /// Apply a GET_NODE_PROTOCOL_INFO response body (starting at the
    /// capabilities byte).
    pub fn update_protocol_info(&mut self, data: &[u8]) {
        if data.len() < 6 {
            tracing::warn!(node_id = self.id, "short protocol info, ignoring");
            return;
        }
        self.listening = data[0] & 0x80 != 0;
        self.routing = data[0] & 0x40 != 0;
        self.frequent_listening = data[1] & 0x60 != 0;
        self.beaming = data[1] & 0x10 != 0;
        self.security = data[1] & 0x01 != 0;
        self.basic_class = data[3];
        self.generic_class = data[4];
        self.specific_class = data[5];
        tracing::info!(
            node_id = self.id,
            listening = self.listening,
            routing = self.routing,
            basic = format_args!("0x{:02x}", self.basic_class),
            generic = format_args!("0x{:02x}", self.generic_class),
            "protocol info"
        );
    }

    /// Apply a node info frame's class list, instantiating handlers for the
    /// classes the engine models. Returns the ids of newly added classes.
    pub fn update_node_info(&mut self, class_ids: &[u8]) -> Vec<u8> {
        let mut added = Vec::new();
        for &class_id in class_ids {
            if class_id == CLASS_MARK {
                // Everything after the mark is controlled, not supported.
                break;
            }
            if self.classes.contains_key(&class_id) {
                continue;
            }
            match command_class::create(class_id) {
                Some(handler) => {
                    tracing::info!(node_id = self.id, class = handler.name(), "adding command class");
                    self.classes.insert(class_id, handler);
                    added.push(class_id);
                }
                None => {
                    tracing::debug!(
                        node_id = self.id,
                        class_id = format_args!("0x{class_id:02x}"),
                        "command class not modelled by the engine"
                    );
                }
            }
        }
        added
    }

    /// Apply a GET_ROUTING_INFO response bitmap.
    pub fn update_neighbours(&mut self, bitmap: &[u8]) {
        if bitmap.len() < NUM_NODE_BITFIELD_BYTES {
            tracing::warn!(node_id = self.id, "short neighbour bitmap, ignoring");
            return;
        }
        self.neighbours
            .copy_from_slice(&bitmap[..NUM_NODE_BITFIELD_BYTES]);
    }

    /// Dispatch an inbound application command to the owning class.
    pub fn application_command(&mut self, class_id: u8, data: &[u8]) -> Vec<ClassEvent> {
        self.read_cnt += 1;
        match self.classes.get_mut(&class_id) {
            Some(handler) => handler.handle_incoming(self.id, data),
            None => {
                tracing::debug!(
                    node_id = self.id,
                    class_id = format_args!("0x{class_id:02x}"),
                    "application command for unknown class"
                );
                Vec::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Command-class access
    // -----------------------------------------------------------------------

    /// Whether the node advertises the given class.
    pub fn has_class(&self, class_id: u8) -> bool {
        self.classes.contains_key(&class_id)
    }

    /// Ids of the instantiated classes.
    pub fn class_ids(&self) -> Vec<u8> {
        self.classes.keys().copied().collect()
    }

    pub(crate) fn class(&self, class_id: u8) -> Option<&dyn CommandClass> {
        self.classes.get(&class_id).map(Box::as_ref)
    }

    pub(crate) fn class_mut(&mut self, class_id: u8) -> Option<&mut Box<dyn CommandClass>> {
        self.classes.get_mut(&class_id)
    }

    /// The node's WakeUp handler, when it has one.
    pub fn wake_up(&self) -> Option<&WakeUp> {
        self.class(command_class::wake_up::CLASS_ID)?
            .as_any()
            .downcast_ref()
    }

    /// Mutable WakeUp handler access.
    pub fn wake_up_mut(&mut self) -> Option<&mut WakeUp> {
        self.class_mut(command_class::wake_up::CLASS_ID)?
            .as_any_mut()
            .downcast_mut()
    }

    /// A message for this node must be parked on the sleeping buffer:
    /// non-listening, not frequently listening, not a controller, and its
    /// WakeUp handler believes the device is asleep.
    pub fn is_asleep(&self) -> bool {
        !self.listening
            && !self.frequent_listening
            && !self.is_controller()
            && self.wake_up().is_some_and(|w| !w.is_awake())
    }

    // -----------------------------------------------------------------------
    // Query state machine
    // -----------------------------------------------------------------------

    /// Current interrogation stage.
    pub fn query_stage(&self) -> QueryStage {
        self.query_stage
    }

    /// Force the stage (snapshot load and init-data reconciliation).
    /// Re-opens the pipeline when moving backwards by design: the
    /// reconciliation reset is the one sanctioned non-monotone transition.
    pub fn set_query_stage(&mut self, stage: QueryStage) {
        self.query_stage = stage;
        self.query_pending = false;
        self.query_retries = 0;
    }

    /// Advance through stages until one issues messages or the pipeline
    /// completes. Returns the actions for the driver to perform in order.
    pub fn advance_queries(&mut self) -> Vec<QueryAction> {
        let mut actions = Vec::new();
        while !self.query_pending && self.query_stage != QueryStage::Complete {
            let stage = self.query_stage;
            let messages = self.stage_messages(stage);
            if messages.is_empty() {
                self.query_stage = stage.next();
                self.query_retries = 0;
                continue;
            }
            tracing::debug!(node_id = self.id, %stage, count = messages.len(), "query stage starting");
            self.query_pending = true;
            for message in messages {
                actions.push(QueryAction::Enqueue(message));
            }
            actions.push(QueryAction::Marker(stage));
        }
        actions
    }

    /// Commit a completed stage (the scheduler popped its marker). Returns
    /// true when the marker matched the in-flight stage.
    pub fn query_stage_complete(&mut self, stage: QueryStage) -> bool {
        if !self.query_pending || stage != self.query_stage {
            tracing::debug!(node_id = self.id, %stage, "stale query stage marker");
            return false;
        }
        tracing::debug!(node_id = self.id, %stage, "query stage complete");
        self.query_pending = false;
        self.query_stage = stage.next();
        self.query_retries = 0;
        true
    }

    /// A required response for `stage` failed. Re-runs the stage while the
    /// retry budget lasts; on exhaustion the stage is skipped, or the whole
    /// pipeline abandoned when the stage proves the node unreachable.
    pub fn query_stage_retry(&mut self, stage: QueryStage, max_tries: u8) {
        if stage != self.query_stage {
            return;
        }
        self.query_retries += 1;
        if self.query_retries < max_tries {
            tracing::info!(node_id = self.id, %stage, attempt = self.query_retries, "retrying query stage");
            self.query_pending = false;
            return;
        }
        if stage.failure_is_fatal() {
            tracing::warn!(node_id = self.id, %stage, "node unreachable, abandoning interrogation");
            self.query_pending = false;
            self.query_stage = QueryStage::Complete;
        } else {
            tracing::warn!(node_id = self.id, %stage, "query stage failed, skipping");
            self.query_pending = false;
            self.query_stage = stage.next();
        }
        self.query_retries = 0;
    }

    // -----------------------------------------------------------------------
    // Snapshot conversion
    // -----------------------------------------------------------------------

    /// Capture the persisted subset of this node.
    pub(crate) fn to_record(&self) -> crate::persist::NodeRecord {
        crate::persist::NodeRecord {
            id: self.id,
            listening: self.listening,
            frequent_listening: self.frequent_listening,
            routing: self.routing,
            beaming: self.beaming,
            security: self.security,
            basic: self.basic_class,
            generic: self.generic_class,
            specific: self.specific_class,
            manufacturer_id: format!("0x{:04x}", self.manufacturer_id),
            product_type: format!("0x{:04x}", self.product_type),
            product_id: format!("0x{:04x}", self.product_id),
            name: self.name.clone(),
            location: self.location.clone(),
            neighbours: self.neighbours.to_vec(),
            command_classes: self
                .classes
                .values()
                .map(|class| crate::persist::ClassRecord {
                    id: class.class_id(),
                    state: class.serialize(),
                })
                .collect(),
        }
    }

    /// Rebuild a node from a snapshot record, at the Complete stage; the
    /// init-data reconciliation decides whether to re-open the pipeline.
    pub(crate) fn from_record(record: &crate::persist::NodeRecord) -> Self {
        let mut node = Node::new(record.id);
        node.listening = record.listening;
        node.frequent_listening = record.frequent_listening;
        node.routing = record.routing;
        node.beaming = record.beaming;
        node.security = record.security;
        node.basic_class = record.basic;
        node.generic_class = record.generic;
        node.specific_class = record.specific;
        node.manufacturer_id = crate::persist::parse_hex_u16(&record.manufacturer_id);
        node.product_type = crate::persist::parse_hex_u16(&record.product_type);
        node.product_id = crate::persist::parse_hex_u16(&record.product_id);
        node.name = record.name.clone();
        node.location = record.location.clone();
        if record.neighbours.len() == NUM_NODE_BITFIELD_BYTES {
            node.neighbours.copy_from_slice(&record.neighbours);
        }
        for class_record in &record.command_classes {
            match command_class::create(class_record.id) {
                Some(mut handler) => {
                    handler.deserialize(&class_record.state);
                    node.classes.insert(class_record.id, handler);
                }
                None => {
                    tracing::debug!(
                        node_id = record.id,
                        class_id = format_args!("0x{:02x}", class_record.id),
                        "snapshot names a class the engine does not model"
                    );
                }
            }
        }
        node.query_stage = QueryStage::Complete;
        node
    }

    fn stage_messages(&self, stage: QueryStage) -> Vec<Message> {
        match stage {
            QueryStage::ProtocolInfo => {
                let mut msg = Message::new(
                    "get node protocol info",
                    self.id,
                    REQUEST,
                    func::ZW_GET_NODE_PROTOCOL_INFO,
                    false,
                );
                msg.append(self.id);
                msg.expect_reply(func::ZW_GET_NODE_PROTOCOL_INFO);
                vec![msg]
            }
            QueryStage::Probe => {
                // NO_OPERATION: proves reachability before asking questions.
                vec![send_data("no-op probe", self.id, 0x00, 0x00, &[])]
            }
            QueryStage::NodeInfo => {
                let mut msg = Message::new(
                    "request node info",
                    self.id,
                    REQUEST,
                    func::ZW_REQUEST_NODE_INFO,
                    false,
                );
                msg.append(self.id);
                msg.expect_reply(func::ZW_APPLICATION_UPDATE);
                vec![msg]
            }
            QueryStage::Neighbours => {
                let mut msg = Message::new(
                    "get routing info",
                    self.id,
                    REQUEST,
                    func::ZW_GET_ROUTING_INFO,
                    false,
                );
                msg.append(self.id);
                msg.expect_reply(func::ZW_GET_ROUTING_INFO);
                vec![msg]
            }
            QueryStage::Complete => Vec::new(),
            stage => self
                .classes
                .values()
                .flat_map(|class| class.request_state(self.id, stage))
                .collect(),
        }
    }
}

/// The 232-slot node arena. Index 0 is unused; ids index directly.
pub struct NodeTable {
    slots: Vec<Option<Node>>,
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: (0..=MAX_NODES).map(|_| None).collect(),
        }
    }

    /// The node with this id, if known.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(usize::from(id))?.as_ref()
    }

    /// Mutable access to the node with this id.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(usize::from(id))?.as_mut()
    }

    /// Insert (replacing any existing entry). Ids outside 1..=232 are
    /// rejected.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        let id = usize::from(node.id());
        if id == 0 || id > MAX_NODES {
            tracing::warn!(node_id = node.id(), "node id out of range, dropping");
            return None;
        }
        self.slots[id].replace(node)
    }

    /// Unlink and return the node with this id.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.slots.get_mut(usize::from(id))?.take()
    }

    /// Iterate known nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Iterate known nodes mutably in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when no nodes are known.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Drop every node (driver reset).
    pub fn clear(&mut self) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self.iter().map(Node::id).collect();
        for slot in &mut self.slots {
            *slot = None;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_info_decodes_the_flag_bytes() {
        let mut node = Node::new(5);
        // listening+routing, beaming+security, reserved, basic, generic, specific
        node.update_protocol_info(&[0xc0, 0x11, 0x00, 0x04, 0x10, 0x01]);
        assert!(node.is_listening());
        assert!(node.is_routing());
        assert!(node.is_beaming());
        assert!(node.is_security_capable());
        assert!(!node.is_frequent_listening());
        assert_eq!(node.device_classes(), (0x04, 0x10, 0x01));
        assert!(!node.is_controller());
    }

    #[test]
    fn node_info_stops_at_the_class_mark() {
        let mut node = Node::new(5);
        let added = node.update_node_info(&[0x20, CLASS_MARK, 0x84]);
        assert_eq!(added, vec![0x20]);
        assert!(node.has_class(0x20));
        assert!(!node.has_class(0x84));
    }

    #[test]
    fn sleeping_requires_a_wake_up_class() {
        let mut node = Node::new(7);
        node.update_protocol_info(&[0x00, 0x00, 0x00, 0x04, 0x10, 0x01]);
        // Non-listening but no WakeUp class yet: not redirected.
        assert!(!node.is_asleep());

        node.update_node_info(&[0x84]);
        assert!(node.is_asleep());

        node.wake_up_mut().unwrap().set_awake(true);
        assert!(!node.is_asleep());
    }

    #[test]
    fn listening_nodes_are_never_asleep() {
        let mut node = Node::new(3);
        node.update_protocol_info(&[0x80, 0x00, 0x00, 0x04, 0x10, 0x01]);
        node.update_node_info(&[0x84]);
        assert!(!node.is_asleep());
    }

    #[test]
    fn advance_queries_starts_with_protocol_info() {
        let mut node = Node::new(5);
        let actions = node.advance_queries();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], QueryAction::Enqueue(m) if m.function() == func::ZW_GET_NODE_PROTOCOL_INFO));
        assert!(matches!(actions[1], QueryAction::Marker(QueryStage::ProtocolInfo)));
        // Pending: nothing more until the marker commits.
        assert!(node.advance_queries().is_empty());
    }

    #[test]
    fn stages_advance_monotonically_through_markers() {
        let mut node = Node::new(5);
        let mut stages = Vec::new();
        loop {
            let actions = node.advance_queries();
            let Some(QueryAction::Marker(stage)) = actions.last() else {
                break;
            };
            stages.push(*stage);
            assert!(node.query_stage_complete(*stage));
        }
        assert_eq!(node.query_stage(), QueryStage::Complete);
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted, "stages must be visited in order");
    }

    #[test]
    fn retry_reruns_the_same_stage_then_abandons() {
        let mut node = Node::new(5);
        node.advance_queries();
        assert_eq!(node.query_stage(), QueryStage::ProtocolInfo);

        node.query_stage_retry(QueryStage::ProtocolInfo, 3);
        assert_eq!(node.query_stage(), QueryStage::ProtocolInfo);
        node.query_stage_retry(QueryStage::ProtocolInfo, 3);
        assert_eq!(node.query_stage(), QueryStage::ProtocolInfo);
        // Third failure exhausts the budget; ProtocolInfo failure is fatal.
        node.query_stage_retry(QueryStage::ProtocolInfo, 3);
        assert_eq!(node.query_stage(), QueryStage::Complete);
    }

    #[test]
    fn non_fatal_stage_failure_skips_forward() {
        let mut node = Node::new(5);
        node.set_query_stage(QueryStage::Associations);
        node.update_node_info(&[0x85]);
        node.advance_queries();
        for _ in 0..3 {
            node.query_stage_retry(QueryStage::Associations, 3);
        }
        assert_eq!(node.query_stage(), QueryStage::Neighbours);
    }

    #[test]
    fn table_rejects_out_of_range_ids() {
        let mut table = NodeTable::new();
        table.insert(Node::new(0));
        assert!(table.is_empty());
        table.insert(Node::new(1));
        table.insert(Node::new(232));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn neighbour_bit_lookup() {
        let mut node = Node::new(2);
        let mut bitmap = [0u8; NUM_NODE_BITFIELD_BYTES];
        bitmap[0] = 0b0000_0101; // nodes 1 and 3
        node.update_neighbours(&bitmap);
        assert!(node.is_neighbour(1));
        assert!(!node.is_neighbour(2));
        assert!(node.is_neighbour(3));
    }
}
