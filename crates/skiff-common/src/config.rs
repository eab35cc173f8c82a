//! Node configuration structures.
//!
//! Configuration is deserialized from a JSON or TOML file and validated
//! before the node starts; an invalid configuration refuses to start.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the node process and the virtual machines it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of pre-warmed VMs to keep in the pool.
    #[serde(default = "default_machine_pool_size")]
    pub machine_pool_size: usize,

    /// Deadline for the in-guest agent's first handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub agent_handshake_timeout_ms: u64,

    /// Path to the kernel image handed to the VMM driver.
    #[serde(default)]
    pub kernel_filepath: PathBuf,

    /// Path to the root filesystem image handed to the VMM driver.
    #[serde(default)]
    pub rootfs_filepath: PathBuf,

    /// CNI settings handed to the VMM driver.
    #[serde(default)]
    pub cni: CniConfig,

    /// Address of the internal bus as visible from the guest.
    ///
    /// This is not necessarily the address the bus actually listens on
    /// inside the node.
    #[serde(default = "default_internal_node_host")]
    pub internal_node_host: IpAddr,

    /// Port of the internal bus as visible from the guest.
    #[serde(default = "default_internal_node_port")]
    pub internal_node_port: u16,

    /// Bypass the VMM entirely; the core still addresses VMs by `vm_id`.
    #[serde(default)]
    pub no_sandbox: bool,

    /// Skip the CNI reset normally performed at startup.
    #[serde(default)]
    pub preserve_network: bool,

    /// Workload type tags this node accepts.
    #[serde(default = "default_workload_types")]
    pub workload_types: Vec<String>,

    /// Issuer public keys permitted to sign deploy requests.
    #[serde(default)]
    pub valid_issuers: Vec<String>,

    /// Opaque labels attached to this node.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Resource template applied to every pooled VM.
    #[serde(default)]
    pub machine_template: MachineTemplate,
}

/// CNI settings consumed by the VMM driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniConfig {
    #[serde(default = "default_cni_subnet")]
    pub subnet: String,
    #[serde(default = "default_cni_interface")]
    pub interface_name: String,
    #[serde(default = "default_cni_network")]
    pub network_name: String,
    #[serde(default)]
    pub bin_path: Vec<PathBuf>,
}

/// Resource shape of a pooled VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MachineTemplate {
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u32,
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: u32,
}

fn default_machine_pool_size() -> usize {
    1
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_internal_node_host() -> IpAddr {
    "192.168.127.1".parse().expect("valid address literal")
}

fn default_internal_node_port() -> u16 {
    9222
}

fn default_workload_types() -> Vec<String> {
    vec!["elf".to_string(), "wasm".to_string(), "js".to_string()]
}

fn default_cni_subnet() -> String {
    "192.168.127.0/24".to_string()
}

fn default_cni_interface() -> String {
    "veth0".to_string()
}

fn default_cni_network() -> String {
    "fcnet".to_string()
}

fn default_vcpu_count() -> u32 {
    1
}

fn default_mem_size_mib() -> u32 {
    256
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            subnet: default_cni_subnet(),
            interface_name: default_cni_interface(),
            network_name: default_cni_network(),
            bin_path: Vec::new(),
        }
    }
}

impl Default for MachineTemplate {
    fn default() -> Self {
        Self {
            vcpu_count: default_vcpu_count(),
            mem_size_mib: default_mem_size_mib(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine_pool_size: default_machine_pool_size(),
            agent_handshake_timeout_ms: default_handshake_timeout_ms(),
            kernel_filepath: PathBuf::new(),
            rootfs_filepath: PathBuf::new(),
            cni: CniConfig::default(),
            internal_node_host: default_internal_node_host(),
            internal_node_port: default_internal_node_port(),
            no_sandbox: false,
            preserve_network: false,
            workload_types: default_workload_types(),
            valid_issuers: Vec::new(),
            tags: HashMap::new(),
            machine_template: MachineTemplate::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON or TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let config: NodeConfig = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Called at construction; a failing validation refuses to start the
    /// node.
    pub fn validate(&self) -> Result<()> {
        if self.machine_pool_size < 1 {
            return Err(Error::InvalidConfig(
                "machine_pool_size must be >= 1".to_string(),
            ));
        }

        if !self.no_sandbox {
            if self.kernel_filepath.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(
                    "kernel_filepath is required".to_string(),
                ));
            }
            if self.rootfs_filepath.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(
                    "rootfs_filepath is required".to_string(),
                ));
            }

            // The guest reaches the bus through the CNI network, so the
            // advertised host must live inside that subnet.
            let (subnet_base, prefix_len) =
                parse_ipv4_subnet(&self.cni.subnet).ok_or_else(|| {
                    Error::InvalidConfig(format!("invalid CNI subnet: {}", self.cni.subnet))
                })?;
            let IpAddr::V4(host) = self.internal_node_host else {
                return Err(Error::InvalidConfig(
                    "internal_node_host must be an IPv4 address".to_string(),
                ));
            };
            let mask = u32::MAX << (32 - prefix_len);
            if (u32::from(host) & mask) != (subnet_base & mask) {
                return Err(Error::InvalidConfig(
                    "internal node host must be in the CNI subnet".to_string(),
                ));
            }
        }

        if self.machine_template.vcpu_count == 0 {
            return Err(Error::InvalidConfig("vcpu_count must be > 0".to_string()));
        }
        if self.machine_template.mem_size_mib == 0 {
            return Err(Error::InvalidConfig(
                "mem_size_mib must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the agent handshake deadline as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_handshake_timeout_ms)
    }
}

fn parse_ipv4_subnet(subnet: &str) -> Option<(u32, u32)> {
    let (addr, len) = subnet.split_once('/')?;
    let ip: std::net::Ipv4Addr = addr.parse().ok()?;
    let len: u32 = len.parse().ok()?;
    if !(8..=30).contains(&len) {
        return None;
    }
    Some((u32::from(ip), len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.machine_pool_size, 1);
        assert_eq!(config.agent_handshake_timeout_ms, 5000);
        assert_eq!(config.internal_node_port, 9222);
        assert_eq!(config.machine_template.vcpu_count, 1);
        assert_eq!(config.machine_template.mem_size_mib, 256);
        assert_eq!(config.workload_types, vec!["elf", "wasm", "js"]);
        assert_eq!(config.cni.network_name, "fcnet");
    }

    #[test]
    fn test_handshake_timeout_helper() {
        let config = NodeConfig {
            agent_handshake_timeout_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.handshake_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_pool_size() {
        let config = NodeConfig {
            machine_pool_size: 0,
            no_sandbox: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_images_when_sandboxed() {
        let config = NodeConfig::default();
        assert!(config.validate().is_err());

        let config = NodeConfig {
            kernel_filepath: PathBuf::from("/var/lib/skiff/vmlinux"),
            rootfs_filepath: PathBuf::from("/var/lib/skiff/rootfs.ext4"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_sandbox_skips_image_checks() {
        let config = NodeConfig {
            no_sandbox: true,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    fn sandboxed_config() -> NodeConfig {
        NodeConfig {
            kernel_filepath: PathBuf::from("/var/lib/skiff/vmlinux"),
            rootfs_filepath: PathBuf::from("/var/lib/skiff/rootfs.ext4"),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_host_must_be_in_cni_subnet() {
        let config = NodeConfig {
            internal_node_host: "10.0.0.1".parse().unwrap(),
            ..sandboxed_config()
        };
        assert!(config.validate().is_err());

        // The default host sits inside the default subnet.
        assert!(sandboxed_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_subnet() {
        let config = NodeConfig {
            cni: CniConfig {
                subnet: "not-a-subnet".to_string(),
                ..Default::default()
            },
            ..sandboxed_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_sandbox_skips_subnet_check() {
        let config = NodeConfig {
            no_sandbox: true,
            internal_node_host: "10.0.0.1".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"machine_pool_size": 3, "no_sandbox": true}"#;
        let config: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.machine_pool_size, 3);
        assert!(config.no_sandbox);
        assert_eq!(config.agent_handshake_timeout_ms, 5000);
    }
}
