//! Stable machine identity, resolved once at process start and used as the
//! default node name across the protocol.
//!
//! Resolution order: the OS machine-id, then the first non-loopback MAC
//! address, then a random identity persisted under the state directory so
//! the name survives restarts even on machines with neither.

use std::fs;
use std::path::PathBuf;

use rand::RngCore;

use crate::error::{FleetError, Result};

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];
const STATE_DIR: &str = ".fleetd";
const IDENTITY_FILE: &str = "machine.id";

/// Resolve the machine identity.
pub fn machine_id() -> Result<String> {
    if let Some(id) = os_machine_id() {
        return Ok(id);
    }
    if let Some(mac) = first_mac_address() {
        return Ok(mac);
    }
    persisted_id()
}

/// Fold the identity into the snowflake node bits (10 bits).
pub fn node_bits(id: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in id.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h & 0x3ff
}

fn os_machine_id() -> Option<String> {
    for path in MACHINE_ID_PATHS {
        if let Ok(raw) = fs::read_to_string(path) {
            let id = raw.trim().to_string();
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    None
}

fn first_mac_address() -> Option<String> {
    let entries = fs::read_dir("/sys/class/net").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        if let Ok(raw) = fs::read_to_string(entry.path().join("address")) {
            let mac = raw.trim().to_string();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac);
            }
        }
    }
    None
}

fn state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR)
}

fn persisted_id() -> Result<String> {
    let dir = state_dir();
    let path = dir.join(IDENTITY_FILE);
    if let Ok(raw) = fs::read_to_string(&path) {
        let id = raw.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    fs::create_dir_all(&dir)?;
    fs::write(&path, &id).map_err(FleetError::Io)?;
    Ok(id)
}
