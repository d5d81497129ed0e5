//! Test harness: a scripted controller chip behind a MockPort.
//!
//! The simulator consumes everything the driver writes, answers the Serial
//! API handshake, and models a small mesh (listening switches, sleepers,
//! silent nodes). Tests observe notifications through a subscriber and the
//! raw outbound frames through the simulator's log.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use zwire_core::{Driver, DriverOptions, Notification};
use zwire_serial::{ControllerPort, MockPort};

pub const HOME_ID: u32 = 0x0123_abcd;
pub const CONTROLLER_NODE: u8 = 1;

const SOF: u8 = 0x01;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const REQUEST: u8 = 0x00;
const RESPONSE: u8 = 0x01;

/// One simulated device on the mesh.
#[derive(Debug, Clone)]
pub struct SimNode {
    pub listening: bool,
    pub classes: Vec<u8>,
    /// SEND_DATA callbacks report NO_ACK (device believed asleep)
    pub silent: bool,
    /// SEND_DATA callbacks never arrive at all (retry-budget tests)
    pub drop_callbacks: bool,
    pub basic_value: u8,
}

impl SimNode {
    pub fn switch() -> Self {
        Self {
            listening: true,
            classes: vec![0x20],
            silent: false,
            drop_callbacks: false,
            basic_value: 0,
        }
    }

    pub fn sleeper() -> Self {
        Self {
            listening: false,
            classes: vec![0x20, 0x84],
            silent: false,
            drop_callbacks: false,
            basic_value: 0,
        }
    }
}

/// The simulated network and a log of every frame the driver sent.
pub struct SimNet {
    pub nodes: BTreeMap<u8, SimNode>,
    /// `(when, frame body without SOF/checksum)` for every outbound frame
    pub log: Vec<(Instant, Vec<u8>)>,
}

impl SimNet {
    pub fn new(nodes: BTreeMap<u8, SimNode>) -> Self {
        Self { nodes, log: Vec::new() }
    }

    /// Frames whose function id matches, in send order. Logged bodies are
    /// `[len, type, function, payload...]`.
    pub fn sent_with_function(&self, function: u8) -> Vec<(Instant, Vec<u8>)> {
        self.log
            .iter()
            .filter(|(_, body)| body.len() > 2 && body[2] == function)
            .cloned()
            .collect()
    }

    /// SEND_DATA frames addressed to `node_id`.
    pub fn send_data_to(&self, node_id: u8) -> Vec<(Instant, Vec<u8>)> {
        self.sent_with_function(0x13)
            .into_iter()
            .filter(|(_, body)| body.get(3) == Some(&node_id))
            .collect()
    }
}

/// Build a full wire frame: SOF, length, body, checksum.
pub fn frame(msg_type: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(SOF);
    out.push((payload.len() + 3) as u8);
    out.push(msg_type);
    out.push(function);
    out.extend_from_slice(payload);
    let checksum = out[1..].iter().fold(0xffu8, |acc, b| acc ^ b);
    out.push(checksum);
    out
}

/// A running driver wired to the simulator.
pub struct Harness {
    pub driver: Driver,
    pub port: Arc<MockPort>,
    pub net: Arc<Mutex<SimNet>>,
    pub notifications: UnboundedReceiver<Notification>,
    sim: JoinHandle<()>,
}

impl Harness {
    /// Start a driver against a simulated network and wait for the
    /// handshake and initial interrogation to settle (AllNodesQueried or
    /// AwakeNodesQueried).
    pub async fn start(options: DriverOptions, nodes: BTreeMap<u8, SimNode>) -> Self {
        let mut harness = Self::start_without_settling(options, nodes).await;
        harness
            .wait_for(|n| {
                matches!(
                    n,
                    Notification::AllNodesQueried { .. } | Notification::AwakeNodesQueried { .. }
                )
            })
            .await;
        harness
    }

    /// Start a driver without waiting for interrogation to finish.
    pub async fn start_without_settling(
        options: DriverOptions,
        nodes: BTreeMap<u8, SimNode>,
    ) -> Self {
        let port = Arc::new(MockPort::new());
        let net = Arc::new(Mutex::new(SimNet::new(nodes)));
        let sim = spawn_sim(Arc::clone(&port), Arc::clone(&net));

        let driver = Driver::new(Arc::clone(&port) as Arc<dyn ControllerPort>, options);
        let notifications = driver.subscribe();
        driver.start().expect("driver starts once");

        Self { driver, port, net, notifications, sim }
    }

    /// Next notification matching the predicate; panics after a generous
    /// timeout so a wedged driver fails the test instead of hanging it.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&Notification) -> bool,
    ) -> Notification {
        let deadline = Duration::from_secs(600);
        tokio::time::timeout(deadline, async {
            loop {
                let notification = self
                    .notifications
                    .recv()
                    .await
                    .expect("notification stream ended");
                if predicate(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("expected notification never arrived")
    }

    /// Drain everything currently queued without waiting.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    /// Stop the simulator so the test can script the wire by hand.
    pub fn take_over_wire(&self) {
        self.sim.abort();
        self.port.take_written();
    }

    pub async fn shutdown(self) {
        self.sim.abort();
        self.driver.shutdown().await;
    }
}

fn spawn_sim(port: Arc<MockPort>, net: Arc<Mutex<SimNet>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            port.wait_for_write(1).await;
            buf.extend(port.take_written());
            while let Some(body) = parse_one(&mut buf) {
                if let Some(body) = body {
                    net.lock().unwrap().log.push((Instant::now(), body.clone()));
                    respond(&port, &net, &body);
                }
            }
        }
    })
}

/// Consume one item from the outbound stream. `Some(None)` is a signal
/// byte; `Some(Some(body))` a frame body `[len, type, function, payload]`
/// without the checksum; `None` means more bytes are needed.
fn parse_one(buf: &mut Vec<u8>) -> Option<Option<Vec<u8>>> {
    match buf.first()? {
        &ACK | &NAK | &CAN => {
            buf.remove(0);
            Some(None)
        }
        &SOF => {
            let length = usize::from(*buf.get(1)?);
            if buf.len() < length + 2 {
                return None;
            }
            let body: Vec<u8> = buf[1..1 + length].to_vec();
            buf.drain(..length + 2);
            Some(Some(body))
        }
        _ => {
            buf.remove(0);
            Some(None)
        }
    }
}

/// Answer one outbound frame the way the chip and the mesh would.
fn respond(port: &MockPort, net: &Arc<Mutex<SimNet>>, body: &[u8]) {
    // body = [len, type, function, payload...]
    if body.len() < 3 || body[1] != REQUEST {
        return;
    }
    let function = body[2];
    let payload = &body[3..];

    // Every verified frame is acknowledged first.
    port.inject(&[ACK]);

    match function {
        // ZW_GET_VERSION
        0x15 => {
            let mut p = b"Z-Wave 3.99\0".to_vec();
            p.push(0x01); // static controller library
            port.inject(&frame(RESPONSE, 0x15, &p));
        }
        // ZW_MEMORY_GET_ID
        0x20 => {
            let mut p = HOME_ID.to_be_bytes().to_vec();
            p.push(CONTROLLER_NODE);
            port.inject(&frame(RESPONSE, 0x20, &p));
        }
        // ZW_GET_CONTROLLER_CAPABILITIES
        0x05 => port.inject(&frame(RESPONSE, 0x05, &[0x1c])),
        // SERIAL_API_GET_CAPABILITIES
        0x07 => {
            let mut p = vec![2, 78, 0x00, 0x86, 0x00, 0x01, 0x00, 0x5a];
            p.extend_from_slice(&[0xff; 32]);
            port.inject(&frame(RESPONSE, 0x07, &p));
        }
        // ZW_GET_SUC_NODE_ID
        0x56 => port.inject(&frame(RESPONSE, 0x56, &[0])),
        // SERIAL_API_GET_INIT_DATA
        0x02 => {
            let mut bitmap = [0u8; 29];
            for &id in net.lock().unwrap().nodes.keys() {
                let bit = usize::from(id) - 1;
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
            let mut p = vec![3, 0x08, 29];
            p.extend_from_slice(&bitmap);
            port.inject(&frame(RESPONSE, 0x02, &p));
        }
        // ZW_GET_NODE_PROTOCOL_INFO
        0x41 => {
            let node_id = payload[0];
            let listening = net
                .lock()
                .unwrap()
                .nodes
                .get(&node_id)
                .is_some_and(|n| n.listening);
            let caps = if listening { 0xc0 } else { 0x40 };
            port.inject(&frame(RESPONSE, 0x41, &[caps, 0x00, 0x00, 0x04, 0x10, 0x01]));
        }
        // ZW_REQUEST_NODE_INFO -> accepted, then the application update
        0x60 => {
            let node_id = payload[0];
            let classes = net
                .lock()
                .unwrap()
                .nodes
                .get(&node_id)
                .map(|n| n.classes.clone())
                .unwrap_or_default();
            port.inject(&frame(RESPONSE, 0x60, &[0x01]));
            let mut p = vec![0x84, node_id, (3 + classes.len()) as u8, 0x04, 0x10, 0x01];
            p.extend_from_slice(&classes);
            port.inject(&frame(REQUEST, 0x49, &p));
        }
        // ZW_GET_ROUTING_INFO
        0x80 => port.inject(&frame(RESPONSE, 0x80, &[0u8; 29])),
        // ZW_GET_VIRTUAL_NODES
        0xa5 => port.inject(&frame(RESPONSE, 0xa5, &[0u8; 29])),
        // ZW_SEND_DATA
        0x13 => respond_send_data(port, net, payload),
        _ => {}
    }
}

fn respond_send_data(port: &MockPort, net: &Arc<Mutex<SimNet>>, payload: &[u8]) {
    if payload.len() < 4 {
        return;
    }
    let node_id = payload[0];
    let class_id = payload[2];
    let command = payload[3];
    let callback_id = *payload.last().unwrap();

    let node = net.lock().unwrap().nodes.get(&node_id).cloned();

    // The chip accepts the frame for transmission.
    port.inject(&frame(RESPONSE, 0x13, &[0x01]));

    // Broadcast never produces a per-node ACK beyond the OK callback.
    if node_id == 0xff {
        port.inject(&frame(REQUEST, 0x13, &[callback_id, 0x00]));
        return;
    }

    let Some(node) = node else {
        port.inject(&frame(REQUEST, 0x13, &[callback_id, 0x04])); // no route
        return;
    };
    if node.drop_callbacks {
        return;
    }
    if node.silent {
        port.inject(&frame(REQUEST, 0x13, &[callback_id, 0x01])); // no ACK
        return;
    }

    port.inject(&frame(REQUEST, 0x13, &[callback_id, 0x00]));

    // Answer the inner command when it asks for a report.
    match (class_id, command) {
        // BASIC_GET
        (0x20, 0x02) => {
            port.inject(&frame(REQUEST, 0x04, &[0x00, node_id, 3, 0x20, 0x03, node.basic_value]));
        }
        // WAKE_UP_INTERVAL_GET
        (0x84, 0x05) => {
            port.inject(&frame(REQUEST, 0x04, &[0x00, node_id, 5, 0x84, 0x06, 0x00, 0x0e, 0x10]));
        }
        // ASSOCIATION_GROUPINGS_GET
        (0x85, 0x05) => {
            port.inject(&frame(REQUEST, 0x04, &[0x00, node_id, 3, 0x85, 0x06, 0x02]));
        }
        _ => {}
    }
}
