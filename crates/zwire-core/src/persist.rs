//! Network snapshot persistence.
//!
//! The driver's view of the network is written to one document per home id,
//! `zwcfg_0x<homeid>.json` in the configured user path, so a restart can
//! skip straight to the session-ephemeral interrogation stages. Loading is
//! strict: a version, home-id or node-id mismatch abandons the load without
//! touching any state, and the driver simply re-interrogates from the init
//! data. Bridge controllers additionally persist their button map to
//! `zwbutton.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DriverError;
use crate::node::{Node, NodeTable};
use crate::CONFIG_VERSION;

/// Top-level snapshot record.
#[derive(Debug, Serialize, Deserialize)]
pub struct DriverRecord {
    /// Snapshot schema version; must equal [`CONFIG_VERSION`]
    pub version: u32,
    /// Network id, hexadecimal ("0x01234abc")
    pub home_id: String,
    /// The controller's own node id
    pub node_id: u8,
    /// Serial API capability byte from the init data
    pub api_capabilities: u8,
    /// Controller capability byte
    pub controller_capabilities: u8,
    /// Poll sweep interval, seconds
    pub poll_interval: u64,
    /// Per-node records
    pub nodes: Vec<NodeRecord>,
}

/// One persisted node.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node id
    pub id: u8,
    /// Always-on receiver
    pub listening: bool,
    /// Beam-woken receiver
    pub frequent_listening: bool,
    /// Routes for others
    pub routing: bool,
    /// Beams to neighbours
    pub beaming: bool,
    /// Security capable
    pub security: bool,
    /// Basic device class
    pub basic: u8,
    /// Generic device class
    pub generic: u8,
    /// Specific device class
    pub specific: u8,
    /// Manufacturer id, hexadecimal ("0x0086")
    pub manufacturer_id: String,
    /// Product type, hexadecimal
    pub product_type: String,
    /// Product id, hexadecimal
    pub product_id: String,
    /// Human-editable name
    pub name: String,
    /// Human-editable location
    pub location: String,
    /// 29-byte neighbour bitmap
    pub neighbours: Vec<u8>,
    /// Instantiated command classes and their state
    pub command_classes: Vec<ClassRecord>,
}

/// Persisted state of one command class instance.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClassRecord {
    /// Command class id
    pub id: u8,
    /// Class-defined state blob
    pub state: serde_json::Value,
}

/// Driver-level fields captured into and restored from a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DriverInfo {
    /// Network id
    pub home_id: u32,
    /// Controller's node id
    pub node_id: u8,
    /// Serial API capability byte
    pub api_capabilities: u8,
    /// Controller capability byte
    pub controller_capabilities: u8,
    /// Poll sweep interval, seconds
    pub poll_interval_secs: u64,
}

/// Snapshot path for a home id.
pub fn snapshot_path(user_path: &Path, home_id: u32) -> PathBuf {
    user_path.join(format!("zwcfg_0x{home_id:08x}.json"))
}

/// Serialise the node table and driver fields to the snapshot document.
pub fn write_snapshot(
    user_path: &Path,
    info: DriverInfo,
    nodes: &NodeTable,
) -> Result<PathBuf, DriverError> {
    if info.home_id == 0 {
        return Err(DriverError::Snapshot(
            "no home id learned yet, refusing to write".into(),
        ));
    }

    let record = DriverRecord {
        version: CONFIG_VERSION,
        home_id: format!("0x{:08x}", info.home_id),
        node_id: info.node_id,
        api_capabilities: info.api_capabilities,
        controller_capabilities: info.controller_capabilities,
        poll_interval: info.poll_interval_secs,
        nodes: nodes.iter().map(Node::to_record).collect(),
    };

    let path = snapshot_path(user_path, info.home_id);
    let json = serde_json::to_string_pretty(&record)
        .map_err(|e| DriverError::Snapshot(e.to_string()))?;
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), nodes = record.nodes.len(), "snapshot written");
    Ok(path)
}

/// Load and validate the snapshot for `home_id`/`node_id`, populating
/// `nodes` on success. Returns the restored node ids (all instantiated at
/// the Complete stage). Any mismatch leaves `nodes` untouched and returns an
/// error.
pub fn read_snapshot(
    user_path: &Path,
    home_id: u32,
    node_id: u8,
    nodes: &mut NodeTable,
) -> Result<Vec<u8>, DriverError> {
    let path = snapshot_path(user_path, home_id);
    let json = std::fs::read_to_string(&path)?;
    let record: DriverRecord =
        serde_json::from_str(&json).map_err(|e| DriverError::Snapshot(e.to_string()))?;

    if record.version != CONFIG_VERSION {
        return Err(DriverError::Snapshot(format!(
            "snapshot {} has schema version {}, need {}",
            path.display(),
            record.version,
            CONFIG_VERSION
        )));
    }
    let recorded_home = parse_hex_u32(&record.home_id).ok_or_else(|| {
        DriverError::Snapshot(format!("snapshot {} has a malformed home id", path.display()))
    })?;
    if recorded_home != home_id {
        return Err(DriverError::Snapshot(format!(
            "snapshot {} is for home 0x{recorded_home:08x}, controller reports 0x{home_id:08x}",
            path.display()
        )));
    }
    if record.node_id != node_id {
        return Err(DriverError::Snapshot(format!(
            "snapshot {} was written by controller node {}, this controller is node {}",
            path.display(),
            record.node_id,
            node_id
        )));
    }

    let mut restored = Vec::with_capacity(record.nodes.len());
    for node_record in &record.nodes {
        let node = Node::from_record(node_record);
        restored.push(node.id());
        nodes.insert(node);
    }
    tracing::info!(path = %path.display(), nodes = restored.len(), "snapshot loaded");
    Ok(restored)
}

/// Driver fields from a snapshot, without touching the node table. Used to
/// restore poll interval and capability bytes after a successful load.
pub fn read_driver_info(user_path: &Path, home_id: u32) -> Option<DriverInfo> {
    let path = snapshot_path(user_path, home_id);
    let json = std::fs::read_to_string(path).ok()?;
    let record: DriverRecord = serde_json::from_str(&json).ok()?;
    Some(DriverInfo {
        home_id: parse_hex_u32(&record.home_id)?,
        node_id: record.node_id,
        api_capabilities: record.api_capabilities,
        controller_capabilities: record.controller_capabilities,
        poll_interval_secs: record.poll_interval,
    })
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).ok()
}

pub(crate) fn parse_hex_u16(s: &str) -> u16 {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Bridge button map
// ---------------------------------------------------------------------------

/// Button map for bridge controllers: node id -> logical button id ->
/// virtual node id.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonMap {
    /// The mapping itself
    pub buttons: BTreeMap<u8, BTreeMap<u8, u8>>,
}

/// Button map file name, independent of home id.
pub const BUTTON_MAP_FILE: &str = "zwbutton.json";

impl ButtonMap {
    /// Load the button map, or an empty one when the file is absent or
    /// malformed.
    pub fn load(user_path: &Path) -> Self {
        let path = user_path.join(BUTTON_MAP_FILE);
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "malformed button map, starting empty");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Write the button map.
    pub fn save(&self, user_path: &Path) -> Result<(), DriverError> {
        let path = user_path.join(BUTTON_MAP_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DriverError::Snapshot(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// The virtual node bound to a button.
    pub fn get(&self, node_id: u8, button_id: u8) -> Option<u8> {
        self.buttons.get(&node_id)?.get(&button_id).copied()
    }

    /// Bind a button to a virtual node.
    pub fn insert(&mut self, node_id: u8, button_id: u8, virtual_node: u8) {
        self.buttons.entry(node_id).or_default().insert(button_id, virtual_node);
    }

    /// Remove a binding; returns the virtual node it pointed at.
    pub fn remove(&mut self, node_id: u8, button_id: u8) -> Option<u8> {
        let map = self.buttons.get_mut(&node_id)?;
        let removed = map.remove(&button_id);
        if map.is_empty() {
            self.buttons.remove(&node_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::QueryStage;

    fn sample_info() -> DriverInfo {
        DriverInfo {
            home_id: 0x0123_abcd,
            node_id: 1,
            api_capabilities: 0x08,
            controller_capabilities: 0x1c,
            poll_interval_secs: 30,
        }
    }

    fn populated_table() -> NodeTable {
        let mut nodes = NodeTable::new();
        let mut node = Node::new(2);
        node.update_protocol_info(&[0x80, 0x00, 0x00, 0x04, 0x10, 0x01]);
        node.update_node_info(&[0x20, 0x85]);
        node.set_name("porch light");
        node.set_location("porch");
        nodes.insert(node);

        let mut sleeper = Node::new(7);
        sleeper.update_protocol_info(&[0x00, 0x00, 0x00, 0x04, 0x07, 0x01]);
        sleeper.update_node_info(&[0x20, 0x84]);
        nodes.insert(sleeper);
        nodes
    }

    #[test]
    fn round_trip_preserves_persisted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info();
        let nodes = populated_table();
        write_snapshot(dir.path(), info, &nodes).unwrap();

        let mut restored = NodeTable::new();
        let ids = read_snapshot(dir.path(), info.home_id, info.node_id, &mut restored).unwrap();
        assert_eq!(ids, vec![2, 7]);

        let original = nodes.get(2).unwrap();
        let loaded = restored.get(2).unwrap();
        assert_eq!(loaded.is_listening(), original.is_listening());
        assert_eq!(loaded.device_classes(), original.device_classes());
        assert_eq!(loaded.name(), "porch light");
        assert_eq!(loaded.location(), "porch");
        assert_eq!(loaded.class_ids(), original.class_ids());
        assert_eq!(loaded.neighbours(), original.neighbours());
        // Loaded nodes start Complete until reconciliation resets them.
        assert_eq!(loaded.query_stage(), QueryStage::Complete);
    }

    #[test]
    fn version_mismatch_aborts_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info();
        write_snapshot(dir.path(), info, &populated_table()).unwrap();

        // Corrupt the version in place.
        let path = snapshot_path(dir.path(), info.home_id);
        let json = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, json.replace("\"version\": 3", "\"version\": 2")).unwrap();

        let mut nodes = NodeTable::new();
        let err = read_snapshot(dir.path(), info.home_id, info.node_id, &mut nodes);
        assert!(err.is_err());
        assert!(nodes.is_empty());
    }

    #[test]
    fn home_id_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info();
        write_snapshot(dir.path(), info, &populated_table()).unwrap();

        // Pretend the controller reports a different home id but the same
        // file name (copy to the other name).
        let other = snapshot_path(dir.path(), 0xdead_beef);
        std::fs::copy(snapshot_path(dir.path(), info.home_id), other).unwrap();

        let mut nodes = NodeTable::new();
        assert!(read_snapshot(dir.path(), 0xdead_beef, info.node_id, &mut nodes).is_err());
        assert!(nodes.is_empty());
    }

    #[test]
    fn node_id_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let info = sample_info();
        write_snapshot(dir.path(), info, &populated_table()).unwrap();

        let mut nodes = NodeTable::new();
        assert!(read_snapshot(dir.path(), info.home_id, 9, &mut nodes).is_err());
        assert!(nodes.is_empty());
    }

    #[test]
    fn refuses_to_write_without_a_home_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = sample_info();
        info.home_id = 0;
        assert!(write_snapshot(dir.path(), info, &NodeTable::new()).is_err());
    }

    #[test]
    fn button_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = ButtonMap::default();
        map.insert(4, 1, 200);
        map.insert(4, 2, 201);
        map.save(dir.path()).unwrap();

        let loaded = ButtonMap::load(dir.path());
        assert_eq!(loaded, map);
        assert_eq!(loaded.get(4, 1), Some(200));
        assert_eq!(loaded.get(4, 3), None);
    }
}
