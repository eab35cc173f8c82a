//! Domain types used throughout the skiff node platform.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a micro-VM.
///
/// Assigned once at VM creation and used as the primary key in every
/// bus subject and every node-side map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(Uuid);

impl VmId {
    /// Create a new random VM ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for VmId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for VmId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of executable artifact a deploy request carries.
///
/// The node validates the tag against its configured `workload_types`;
/// the in-guest agent maps it to an execution provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    /// Statically linked native executable.
    Elf,
    /// WebAssembly module.
    Wasm,
    /// JavaScript source.
    Js,
    /// Any other tag; preserved verbatim for forward compatibility.
    #[serde(untagged)]
    Other(String),
}

impl WorkloadType {
    /// Wire tag for this workload type.
    pub fn as_str(&self) -> &str {
        match self {
            WorkloadType::Elf => "elf",
            WorkloadType::Wasm => "wasm",
            WorkloadType::Js => "js",
            WorkloadType::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for WorkloadType {
    fn from(s: &str) -> Self {
        match s {
            "elf" => WorkloadType::Elf,
            "wasm" => WorkloadType::Wasm,
            "js" => WorkloadType::Js,
            other => WorkloadType::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_unique() {
        let id1 = VmId::new();
        let id2 = VmId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_vm_id_display_roundtrip() {
        let id = VmId::new();
        let parsed: VmId = id.to_string().parse().expect("valid uuid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_vm_id_serde_as_string() {
        let id = VmId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_workload_type_tags() {
        assert_eq!(WorkloadType::Elf.as_str(), "elf");
        assert_eq!(WorkloadType::from("wasm"), WorkloadType::Wasm);
        assert_eq!(
            WorkloadType::from("ruby"),
            WorkloadType::Other("ruby".to_string())
        );
    }

    #[test]
    fn test_workload_type_serde() {
        let json = serde_json::to_string(&WorkloadType::Wasm).unwrap();
        assert_eq!(json, "\"wasm\"");
        let parsed: WorkloadType = serde_json::from_str("\"elf\"").unwrap();
        assert_eq!(parsed, WorkloadType::Elf);
    }

    #[test]
    fn test_workload_type_other_roundtrip() {
        let json = serde_json::to_string(&WorkloadType::Other("ruby".to_string())).unwrap();
        assert_eq!(json, "\"ruby\"");
        let parsed: WorkloadType = serde_json::from_str("\"ruby\"").unwrap();
        assert_eq!(parsed, WorkloadType::Other("ruby".to_string()));
    }

    #[test]
    fn test_workload_type_known_tags_win_over_other() {
        // The untagged fallback only catches tags the named variants
        // don't claim.
        let parsed: WorkloadType = serde_json::from_str("\"wasm\"").unwrap();
        assert_eq!(parsed, WorkloadType::Wasm);
        assert_ne!(parsed, WorkloadType::Other("wasm".to_string()));
    }
}
