//! Serial API wire protocol: signal bytes, function ids and status codes.
//!
//! Multi-byte frames are `SOF, length, type, function, payload…, checksum`
//! where `length` counts everything after itself up to and including the
//! checksum, `type` is [`REQUEST`] or [`RESPONSE`], and the checksum is the
//! XOR of `0xff` with every byte from `length` through the end of the
//! payload. The single bytes [`ACK`], [`NAK`] and [`CAN`] travel outside any
//! frame.

pub mod message;

/// Start of a multi-byte frame
pub const SOF: u8 = 0x01;
/// Frame received and verified
pub const ACK: u8 = 0x06;
/// Frame rejected (bad checksum); sender should retransmit
pub const NAK: u8 = 0x15;
/// Controller dropped the frame to resolve a collision; retransmit
pub const CAN: u8 = 0x18;

/// Host-to-controller (and unsolicited controller-to-host) frame type
pub const REQUEST: u8 = 0x00;
/// Controller answer to the most recent request
pub const RESPONSE: u8 = 0x01;

/// The controller's own context, and the broadcast target
pub const CONTROLLER_NODE_ID: u8 = 0xff;

/// Bytes in the init-data node bitmap (232 bits, bit 0 = node 1)
pub const NUM_NODE_BITFIELD_BYTES: usize = 29;

// ---------------------------------------------------------------------------
// Function ids
// ---------------------------------------------------------------------------

/// Serial API function ids used by the driver.
///
/// The taxonomy is sparse; only the functions the engine sends or routes are
/// named. Ranges of these ids double as the controller-command
/// classification, see [`is_controller_command`].
#[allow(missing_docs)]
pub mod func {
    pub const SERIAL_API_GET_INIT_DATA: u8 = 0x02;
    pub const SERIAL_API_APPL_NODE_INFORMATION: u8 = 0x03;
    pub const APPLICATION_COMMAND_HANDLER: u8 = 0x04;
    pub const ZW_GET_CONTROLLER_CAPABILITIES: u8 = 0x05;
    pub const SERIAL_API_SET_TIMEOUTS: u8 = 0x06;
    pub const SERIAL_API_GET_CAPABILITIES: u8 = 0x07;
    pub const SERIAL_API_SOFT_RESET: u8 = 0x08;
    pub const ZW_SEND_NODE_INFORMATION: u8 = 0x12;
    pub const ZW_SEND_DATA: u8 = 0x13;
    pub const ZW_GET_VERSION: u8 = 0x15;
    pub const ZW_R_F_POWER_LEVEL_SET: u8 = 0x17;
    pub const ZW_MEMORY_GET_ID: u8 = 0x20;
    pub const MEMORY_GET_BYTE: u8 = 0x21;
    pub const ZW_READ_MEMORY: u8 = 0x23;
    pub const ZW_SET_LEARN_NODE_STATE: u8 = 0x40;
    pub const ZW_GET_NODE_PROTOCOL_INFO: u8 = 0x41;
    pub const ZW_SET_DEFAULT: u8 = 0x42;
    pub const ZW_NEW_CONTROLLER: u8 = 0x43;
    pub const ZW_REPLICATION_COMMAND_COMPLETE: u8 = 0x44;
    pub const ZW_REPLICATION_SEND_DATA: u8 = 0x45;
    pub const ZW_ASSIGN_RETURN_ROUTE: u8 = 0x46;
    pub const ZW_DELETE_RETURN_ROUTE: u8 = 0x47;
    pub const ZW_REQUEST_NODE_NEIGHBOR_UPDATE: u8 = 0x48;
    pub const ZW_APPLICATION_UPDATE: u8 = 0x49;
    pub const ZW_ADD_NODE_TO_NETWORK: u8 = 0x4a;
    pub const ZW_REMOVE_NODE_FROM_NETWORK: u8 = 0x4b;
    pub const ZW_CREATE_NEW_PRIMARY: u8 = 0x4c;
    pub const ZW_CONTROLLER_CHANGE: u8 = 0x4d;
    pub const ZW_SET_LEARN_MODE: u8 = 0x50;
    pub const ZW_ENABLE_SUC: u8 = 0x52;
    pub const ZW_REQUEST_NETWORK_UPDATE: u8 = 0x53;
    pub const ZW_SET_SUC_NODE_ID: u8 = 0x54;
    pub const ZW_GET_SUC_NODE_ID: u8 = 0x56;
    pub const ZW_REQUEST_NODE_INFO: u8 = 0x60;
    pub const ZW_REMOVE_FAILED_NODE_ID: u8 = 0x61;
    pub const ZW_IS_FAILED_NODE_ID: u8 = 0x62;
    pub const ZW_REPLACE_FAILED_NODE: u8 = 0x63;
    pub const ZW_GET_ROUTING_INFO: u8 = 0x80;
    pub const SERIAL_API_SLAVE_NODE_INFO: u8 = 0xa0;
    pub const APPLICATION_SLAVE_COMMAND_HANDLER: u8 = 0xa1;
    pub const ZW_SEND_SLAVE_NODE_INFO: u8 = 0xa2;
    pub const ZW_SEND_SLAVE_DATA: u8 = 0xa3;
    pub const ZW_SET_SLAVE_LEARN_MODE: u8 = 0xa4;
    pub const ZW_GET_VIRTUAL_NODES: u8 = 0xa5;
    pub const ZW_IS_VIRTUAL_NODE: u8 = 0xa6;
    pub const PROMISCUOUS_APPLICATION_COMMAND_HANDLER: u8 = 0xd1;

    /// Log-friendly name for a function id.
    pub fn name(function: u8) -> &'static str {
        match function {
            SERIAL_API_GET_INIT_DATA => "SERIAL_API_GET_INIT_DATA",
            SERIAL_API_APPL_NODE_INFORMATION => "SERIAL_API_APPL_NODE_INFORMATION",
            APPLICATION_COMMAND_HANDLER => "APPLICATION_COMMAND_HANDLER",
            ZW_GET_CONTROLLER_CAPABILITIES => "ZW_GET_CONTROLLER_CAPABILITIES",
            SERIAL_API_SET_TIMEOUTS => "SERIAL_API_SET_TIMEOUTS",
            SERIAL_API_GET_CAPABILITIES => "SERIAL_API_GET_CAPABILITIES",
            SERIAL_API_SOFT_RESET => "SERIAL_API_SOFT_RESET",
            ZW_SEND_NODE_INFORMATION => "ZW_SEND_NODE_INFORMATION",
            ZW_SEND_DATA => "ZW_SEND_DATA",
            ZW_GET_VERSION => "ZW_GET_VERSION",
            ZW_MEMORY_GET_ID => "ZW_MEMORY_GET_ID",
            ZW_GET_NODE_PROTOCOL_INFO => "ZW_GET_NODE_PROTOCOL_INFO",
            ZW_REPLICATION_SEND_DATA => "ZW_REPLICATION_SEND_DATA",
            ZW_ASSIGN_RETURN_ROUTE => "ZW_ASSIGN_RETURN_ROUTE",
            ZW_DELETE_RETURN_ROUTE => "ZW_DELETE_RETURN_ROUTE",
            ZW_REQUEST_NODE_NEIGHBOR_UPDATE => "ZW_REQUEST_NODE_NEIGHBOR_UPDATE",
            ZW_APPLICATION_UPDATE => "ZW_APPLICATION_UPDATE",
            ZW_ADD_NODE_TO_NETWORK => "ZW_ADD_NODE_TO_NETWORK",
            ZW_REMOVE_NODE_FROM_NETWORK => "ZW_REMOVE_NODE_FROM_NETWORK",
            ZW_CREATE_NEW_PRIMARY => "ZW_CREATE_NEW_PRIMARY",
            ZW_CONTROLLER_CHANGE => "ZW_CONTROLLER_CHANGE",
            ZW_SET_LEARN_MODE => "ZW_SET_LEARN_MODE",
            ZW_ENABLE_SUC => "ZW_ENABLE_SUC",
            ZW_REQUEST_NETWORK_UPDATE => "ZW_REQUEST_NETWORK_UPDATE",
            ZW_SET_SUC_NODE_ID => "ZW_SET_SUC_NODE_ID",
            ZW_GET_SUC_NODE_ID => "ZW_GET_SUC_NODE_ID",
            ZW_REQUEST_NODE_INFO => "ZW_REQUEST_NODE_INFO",
            ZW_REMOVE_FAILED_NODE_ID => "ZW_REMOVE_FAILED_NODE_ID",
            ZW_IS_FAILED_NODE_ID => "ZW_IS_FAILED_NODE_ID",
            ZW_REPLACE_FAILED_NODE => "ZW_REPLACE_FAILED_NODE",
            ZW_GET_ROUTING_INFO => "ZW_GET_ROUTING_INFO",
            ZW_GET_VIRTUAL_NODES => "ZW_GET_VIRTUAL_NODES",
            ZW_SET_SLAVE_LEARN_MODE => "ZW_SET_SLAVE_LEARN_MODE",
            ZW_SEND_SLAVE_NODE_INFO => "ZW_SEND_SLAVE_NODE_INFO",
            APPLICATION_SLAVE_COMMAND_HANDLER => "APPLICATION_SLAVE_COMMAND_HANDLER",
            _ => "UNKNOWN_FUNCTION",
        }
    }
}

/// Classify a function id as a controller network-management command.
///
/// Callbacks for these route to the controller-command state machine rather
/// than to a node. Disjoint numeric ranges keep the check cheap.
pub fn is_controller_command(function: u8) -> bool {
    function == func::SERIAL_API_SOFT_RESET
        || (func::ZW_SET_DEFAULT..=func::ZW_REQUEST_NODE_NEIGHBOR_UPDATE).contains(&function)
        || (func::ZW_ADD_NODE_TO_NETWORK..=func::ZW_GET_SUC_NODE_ID).contains(&function)
        || (func::ZW_REMOVE_FAILED_NODE_ID..=func::ZW_REPLACE_FAILED_NODE).contains(&function)
        || function == func::ZW_GET_ROUTING_INFO
        || function == func::SERIAL_API_SLAVE_NODE_INFO
        || function == func::ZW_SEND_SLAVE_NODE_INFO
        || (func::ZW_SET_SLAVE_LEARN_MODE..=func::ZW_IS_VIRTUAL_NODE).contains(&function)
}

// ---------------------------------------------------------------------------
// Transmit options and completion status (ZW_SEND_DATA)
// ---------------------------------------------------------------------------

/// Ask the target to acknowledge receipt
pub const TRANSMIT_OPTION_ACK: u8 = 0x01;
/// Let the controller route through the mesh
pub const TRANSMIT_OPTION_AUTO_ROUTE: u8 = 0x04;
/// Use explorer frames when routing fails
pub const TRANSMIT_OPTION_EXPLORE: u8 = 0x20;

/// Completion status bits carried in the fourth byte of a SEND_DATA callback.
pub mod transmit_complete {
    /// Delivered and acknowledged
    pub const OK: u8 = 0x00;
    /// Target never acknowledged; it may be asleep
    pub const NO_ACK: u8 = 0x01;
    /// Network busy, soft failure
    pub const FAIL: u8 = 0x02;
    /// No route to the target
    pub const NO_ROUTE: u8 = 0x04;
}

// ---------------------------------------------------------------------------
// Network-management sub-codes
// ---------------------------------------------------------------------------

/// Modes and status codes for ZW_ADD_NODE_TO_NETWORK.
#[allow(missing_docs)]
pub mod add_node {
    pub const ANY: u8 = 0x01;
    pub const CONTROLLER: u8 = 0x02;
    pub const SLAVE: u8 = 0x03;
    pub const EXISTING: u8 = 0x04;
    pub const STOP: u8 = 0x05;
    pub const STOP_FAILED: u8 = 0x06;
    /// OR into the mode for full-power inclusion
    pub const OPTION_HIGH_POWER: u8 = 0x80;

    pub const STATUS_LEARN_READY: u8 = 0x01;
    pub const STATUS_NODE_FOUND: u8 = 0x02;
    pub const STATUS_ADDING_SLAVE: u8 = 0x03;
    pub const STATUS_ADDING_CONTROLLER: u8 = 0x04;
    pub const STATUS_PROTOCOL_DONE: u8 = 0x05;
    pub const STATUS_DONE: u8 = 0x06;
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Modes for ZW_REMOVE_NODE_FROM_NETWORK (status codes mirror add_node).
#[allow(missing_docs)]
pub mod remove_node {
    pub const ANY: u8 = 0x01;
    pub const STOP: u8 = 0x05;
}

/// Start/stop codes for ZW_CREATE_NEW_PRIMARY.
#[allow(missing_docs)]
pub mod create_primary {
    pub const START: u8 = 0x02;
    pub const STOP: u8 = 0x05;
}

/// Start/stop codes for ZW_CONTROLLER_CHANGE.
#[allow(missing_docs)]
pub mod controller_change {
    pub const START: u8 = 0x02;
    pub const STOP: u8 = 0x05;
}

/// Status codes in learn-mode callbacks.
#[allow(missing_docs)]
pub mod learn_mode {
    pub const STARTED: u8 = 0x01;
    pub const DONE: u8 = 0x06;
    pub const FAILED: u8 = 0x07;
}

/// Sub-codes of a ZW_APPLICATION_UPDATE request.
#[allow(missing_docs)]
pub mod update_state {
    pub const SUC_ID: u8 = 0x10;
    pub const DELETE_DONE: u8 = 0x20;
    pub const NEW_ID_ASSIGNED: u8 = 0x40;
    pub const ROUTING_PENDING: u8 = 0x80;
    pub const NODE_INFO_REQ_FAILED: u8 = 0x81;
    pub const NODE_INFO_REQ_DONE: u8 = 0x82;
    pub const NODE_INFO_RECEIVED: u8 = 0x84;
}

/// Status codes of a ZW_REQUEST_NETWORK_UPDATE callback.
#[allow(missing_docs)]
pub mod suc_update {
    pub const DONE: u8 = 0x00;
    pub const ABORT: u8 = 0x01;
    pub const WAIT: u8 = 0x02;
    pub const DISABLED: u8 = 0x03;
    pub const OVERFLOW: u8 = 0x04;
}

/// Status codes in remove/replace-failed-node callbacks.
#[allow(missing_docs)]
pub mod failed_node {
    pub const REMOVED: u8 = 0x01;
    pub const NOT_REMOVED: u8 = 0x02;
    pub const REPLACE_WAITING: u8 = 0x03;
    pub const REPLACE_DONE: u8 = 0x04;
    pub const REPLACE_FAILED: u8 = 0x05;
}

/// Status codes in a ZW_REQUEST_NODE_NEIGHBOR_UPDATE callback.
#[allow(missing_docs)]
pub mod neighbor_update {
    pub const STARTED: u8 = 0x21;
    pub const DONE: u8 = 0x22;
    pub const FAILED: u8 = 0x23;
}

/// Bits of the controller-capabilities byte.
pub mod controller_caps {
    /// Controller is a secondary on the network
    pub const SECONDARY: u8 = 0x01;
    /// Home id was learned from another network
    pub const ON_OTHER_NETWORK: u8 = 0x02;
    /// A SUC-Id server is present
    pub const SIS: u8 = 0x04;
    /// Controller was the original primary before a SIS was added
    pub const REAL_PRIMARY: u8 = 0x08;
    /// Controller is a static update controller
    pub const SUC: u8 = 0x10;
}

/// Library type byte reported by ZW_GET_VERSION.
pub const LIBRARY_TYPE_BRIDGE: u8 = 0x07;

/// XOR checksum over a frame body (`length` byte through end of payload).
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0xff, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_frame() {
        // GET_VERSION request: 01 03 00 15 e9
        assert_eq!(checksum(&[0x03, 0x00, 0x15]), 0xe9);
    }

    #[test]
    fn handshake_sequence_names_the_right_functions() {
        assert_eq!(
            zwire_serial::INIT_SEQUENCE,
            &[
                func::ZW_GET_VERSION,
                func::ZW_MEMORY_GET_ID,
                func::ZW_GET_CONTROLLER_CAPABILITIES,
                func::SERIAL_API_GET_CAPABILITIES,
                func::ZW_GET_SUC_NODE_ID,
            ]
        );
    }

    #[test]
    fn controller_command_ranges() {
        assert!(is_controller_command(func::SERIAL_API_SOFT_RESET));
        assert!(is_controller_command(func::ZW_ADD_NODE_TO_NETWORK));
        assert!(is_controller_command(func::ZW_GET_SUC_NODE_ID));
        assert!(is_controller_command(func::ZW_REPLACE_FAILED_NODE));
        assert!(is_controller_command(func::ZW_GET_ROUTING_INFO));
        assert!(!is_controller_command(func::ZW_SEND_DATA));
        assert!(!is_controller_command(func::APPLICATION_COMMAND_HANDLER));
        assert!(!is_controller_command(func::ZW_REQUEST_NODE_INFO));
    }
}
