//! Outbound message construction and finalisation.

use std::fmt;

use crate::error::FrameError;
use crate::protocol::{checksum, func, CONTROLLER_NODE_ID, SOF};

/// Longest payload that still fits the one-byte length field
/// (length counts type, function, payload and checksum).
const MAX_PAYLOAD: usize = 0xff - 3;

/// An outbound Serial API message and the transaction expectations that
/// travel with it.
///
/// A message is built up, then [finalised](Message::finalize) exactly once:
/// finalisation freezes the wire buffer (SOF, length, type, function,
/// payload, XOR checksum). The driver copies the expectation fields into its
/// transaction state when the message is armed.
#[derive(Debug, Clone)]
pub struct Message {
    target_node_id: u8,
    msg_type: u8,
    function: u8,
    payload: Vec<u8>,
    buffer: Vec<u8>,
    expected_reply: u8,
    expected_command_class_id: u8,
    callback_required: bool,
    callback_id: u8,
    send_attempts: u8,
    description: &'static str,
}

impl Message {
    /// Create a message bound for `target_node_id` (0xff for the controller
    /// itself). `callback_required` asks the driver to allocate a callback id
    /// during finalisation and to append it to the payload.
    pub fn new(
        description: &'static str,
        target_node_id: u8,
        msg_type: u8,
        function: u8,
        callback_required: bool,
    ) -> Self {
        Self {
            target_node_id,
            msg_type,
            function,
            payload: Vec::new(),
            buffer: Vec::new(),
            expected_reply: 0,
            expected_command_class_id: 0,
            callback_required,
            callback_id: 0,
            send_attempts: 0,
            description,
        }
    }

    /// Append one payload byte.
    pub fn append(&mut self, byte: u8) -> &mut Self {
        debug_assert!(self.buffer.is_empty(), "append after finalize");
        self.payload.push(byte);
        self
    }

    /// Append several payload bytes.
    pub fn append_slice(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(self.buffer.is_empty(), "append after finalize");
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Expect a RESPONSE frame with this function id before the transaction
    /// closes.
    pub fn expect_reply(&mut self, function: u8) -> &mut Self {
        self.expected_reply = function;
        self
    }

    /// Expect an APPLICATION_COMMAND_HANDLER reply from the target carrying
    /// this command class.
    pub fn expect_command_class_reply(&mut self, class_id: u8) -> &mut Self {
        self.expected_reply = func::APPLICATION_COMMAND_HANDLER;
        self.expected_command_class_id = class_id;
        self
    }

    /// Compute length and checksum, freezing the wire buffer. `callback_id`
    /// is appended to the payload when the message asked for one; pass the
    /// driver-allocated id (never 0).
    ///
    /// Finalising twice is a no-op; the first buffer stands.
    pub fn finalize(&mut self, callback_id: u8) -> Result<(), FrameError> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        if self.callback_required {
            debug_assert_ne!(callback_id, 0);
            self.callback_id = callback_id;
            self.payload.push(callback_id);
        }
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(self.payload.len()));
        }

        // SOF, length, type, function, payload..., checksum
        let length = (self.payload.len() + 3) as u8;
        self.buffer.reserve(self.payload.len() + 5);
        self.buffer.push(SOF);
        self.buffer.push(length);
        self.buffer.push(self.msg_type);
        self.buffer.push(self.function);
        self.buffer.extend_from_slice(&self.payload);
        self.buffer.push(checksum(&self.buffer[1..]));
        Ok(())
    }

    /// The finalised wire bytes. Empty until [`finalize`](Message::finalize).
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// True once the wire buffer is frozen.
    pub fn is_finalized(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Target node id (0xff = controller).
    pub fn target_node_id(&self) -> u8 {
        self.target_node_id
    }

    /// True when this message is addressed to the controller chip itself.
    pub fn targets_controller(&self) -> bool {
        self.target_node_id == CONTROLLER_NODE_ID
    }

    /// Serial API function id.
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Expected RESPONSE function id, 0 when none.
    pub fn expected_reply(&self) -> u8 {
        self.expected_reply
    }

    /// Expected command class of an APPLICATION_COMMAND reply, 0 when none.
    pub fn expected_command_class_id(&self) -> u8 {
        self.expected_command_class_id
    }

    /// Whether a callback id will be (or has been) assigned at finalisation.
    pub fn callback_required(&self) -> bool {
        self.callback_required
    }

    /// Allocated callback id, 0 when none.
    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    /// Number of times this message has been written to the wire.
    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    /// Count one more write.
    pub fn record_attempt(&mut self) {
        self.send_attempts += 1;
    }

    /// True for the WakeUp "No More Information" command, which is dropped
    /// rather than parked when its target turns out to be asleep.
    pub fn is_wake_up_no_more_information(&self) -> bool {
        use crate::command_class::wake_up;
        self.function == func::ZW_SEND_DATA
            && self.payload.len() >= 4
            && self.payload[2] == wake_up::CLASS_ID
            && self.payload[3] == wake_up::NO_MORE_INFORMATION
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (node {}, func 0x{:02x}",
            self.description, self.target_node_id, self.function
        )?;
        if self.callback_id != 0 {
            write!(f, ", callback 0x{:02x}", self.callback_id)?;
        }
        write!(f, ")")
    }
}

/// Build the standard ZW_SEND_DATA message carrying one command-class
/// payload to a node: `node, len, class, command, args..., txopts` plus the
/// trailing callback id at finalisation.
pub fn send_data(
    description: &'static str,
    node_id: u8,
    class_id: u8,
    command: u8,
    args: &[u8],
) -> Message {
    let mut msg = Message::new(description, node_id, crate::protocol::REQUEST, func::ZW_SEND_DATA, true);
    msg.append(node_id);
    msg.append((args.len() + 2) as u8);
    msg.append(class_id);
    msg.append(command);
    msg.append_slice(args);
    msg.append(crate::protocol::TRANSMIT_OPTION_ACK | crate::protocol::TRANSMIT_OPTION_AUTO_ROUTE);
    msg.expect_reply(func::ZW_SEND_DATA);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::REQUEST;

    #[test]
    fn finalize_builds_the_documented_frame() {
        let mut msg = Message::new("get version", CONTROLLER_NODE_ID, REQUEST, func::ZW_GET_VERSION, false);
        msg.finalize(0).unwrap();
        assert_eq!(msg.buffer(), &[0x01, 0x03, 0x00, 0x15, 0xe9]);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut msg = Message::new("init data", CONTROLLER_NODE_ID, REQUEST, func::SERIAL_API_GET_INIT_DATA, false);
        msg.finalize(0).unwrap();
        let first = msg.buffer().to_vec();
        msg.finalize(0).unwrap();
        assert_eq!(msg.buffer(), &first[..]);
    }

    #[test]
    fn callback_id_lands_at_the_end_of_the_payload() {
        let mut msg = send_data("basic get", 5, 0x20, 0x02, &[]);
        msg.finalize(0x1b).unwrap();
        let buf = msg.buffer();
        // checksum is last, callback id second to last
        assert_eq!(buf[buf.len() - 2], 0x1b);
        assert_eq!(msg.callback_id(), 0x1b);
    }

    #[test]
    fn checksum_verifies_on_the_finalized_buffer() {
        let mut msg = send_data("basic set", 9, 0x20, 0x01, &[0xff]);
        msg.finalize(0x02).unwrap();
        let buf = msg.buffer();
        assert_eq!(crate::protocol::checksum(&buf[1..buf.len() - 1]), buf[buf.len() - 1]);
    }

    #[test]
    fn wake_up_no_more_information_is_recognised() {
        let mut msg = send_data("wake-up no more information", 7, 0x84, 0x08, &[]);
        msg.finalize(0x03).unwrap();
        assert!(msg.is_wake_up_no_more_information());

        let mut other = send_data("basic get", 7, 0x20, 0x02, &[]);
        other.finalize(0x04).unwrap();
        assert!(!other.is_wake_up_no_more_information());
    }
}
