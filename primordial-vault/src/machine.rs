//! Machine-identity detection for the key-derivation binding.
//!
//! The vault key is derived in part from a stable machine identifier so the
//! ciphertext is useless when copied to another host. Which identifier was
//! used is recorded in the vault header; a load on a host whose best
//! available factor is of a different kind refuses with `WrongMachine`
//! rather than silently deriving a key that cannot authenticate.

use primordial_core::error::VaultError;

/// Which machine identifier the vault key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorKind {
    /// `/etc/machine-id` (Linux).
    MachineId,
    /// IOPlatformExpertDevice hardware UUID (macOS).
    HardwareUuid,
    /// Hostname plus interface MAC addresses. Last resort only.
    HostMac,
}

impl FactorKind {
    /// The header tag byte for this factor.
    pub fn tag(self) -> u8 {
        match self {
            FactorKind::MachineId => 1,
            FactorKind::HardwareUuid => 2,
            FactorKind::HostMac => 3,
        }
    }

    /// Parse a header tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FactorKind::MachineId),
            2 => Some(FactorKind::HardwareUuid),
            3 => Some(FactorKind::HostMac),
            _ => None,
        }
    }
}

/// The detected machine identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineFactor {
    /// Which identifier was found.
    pub kind: FactorKind,
    /// Its value. Feeds the KDF; never written to the vault file.
    pub value: String,
}

/// Detect the strongest machine identifier this host offers.
pub fn detect() -> Result<MachineFactor, VaultError> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
            let id = id.trim();
            if !id.is_empty() {
                return Ok(MachineFactor {
                    kind: FactorKind::MachineId,
                    value: id.to_string(),
                });
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Some(uuid) = hardware_uuid() {
            return Ok(MachineFactor {
                kind: FactorKind::HardwareUuid,
                value: uuid,
            });
        }
    }
    host_mac_fallback()
}

#[cfg(target_os = "macos")]
fn hardware_uuid() -> Option<String> {
    let out = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&out.stdout);
    let line = text.lines().find(|l| l.contains("IOPlatformUUID"))?;
    let uuid = line.split('"').nth(3)?;
    if uuid.is_empty() { None } else { Some(uuid.to_string()) }
}

/// Hostname + MAC addresses. Weaker than the primary factors (both can
/// change), which is exactly why the header records which kind was used.
fn host_mac_fallback() -> Result<MachineFactor, VaultError> {
    let mut parts = Vec::new();

    let hostname = std::process::Command::new("hostname")
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|h| !h.is_empty());
    if let Some(h) = hostname {
        parts.push(h);
    }

    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        let mut macs: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_name() != "lo")
            .filter_map(|e| std::fs::read_to_string(e.path().join("address")).ok())
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty() && m != "00:00:00:00:00:00")
            .collect();
        macs.sort();
        parts.extend(macs);
    }

    if parts.is_empty() {
        return Err(VaultError::Io(
            "no machine identifier available on this host".into(),
        ));
    }
    Ok(MachineFactor {
        kind: FactorKind::HostMac,
        value: parts.join("|"),
    })
}
