use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::WORKING_DIRECTORY_DEFAULT;
use crate::error::VirbyError;

/// VM configuration loaded from the JSON file named by `VIRBY_VM_CONFIG_FILE`.
///
/// Immutable after load. Field names are the external interface shared with
/// the nix-darwin module; violations of the ranges below abort startup.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Number of guest CPU cores (>= 1).
    pub cores: u32,
    /// Guest memory in MiB (>= 1024).
    pub memory: u64,
    /// Enable debug logging, serial console capture, and vfkit output drain.
    #[serde(default)]
    pub debug: bool,
    /// Host-side SSH listener port (1024..=65535), bound by launchd.
    pub port: u16,
    /// Mount the Rosetta translation layer into the guest.
    #[serde(default)]
    pub rosetta: bool,
    /// Start the VM on first connection instead of at process entry.
    #[serde(default, rename = "on-demand")]
    pub on_demand: bool,
    /// Idle seconds before the VM is paused or stopped (on-demand mode).
    #[serde(default = "default_ttl", rename = "ttl")]
    pub ttl_seconds: u64,
    /// Extra virtio-fs shares, mount tag -> host path.
    #[serde(default, rename = "shared-dirs")]
    pub shared_dirs: BTreeMap<String, PathBuf>,
    #[serde(default = "default_ip_discovery_timeout")]
    pub ip_discovery_timeout: u64,
    #[serde(default = "default_ssh_ready_timeout")]
    pub ssh_ready_timeout: u64,
    #[serde(default = "default_vm_op_timeout", rename = "vm_pause_timeout")]
    pub pause_timeout: u64,
    #[serde(default = "default_vm_op_timeout", rename = "vm_resume_timeout")]
    pub resume_timeout: u64,
    #[serde(default = "default_vm_op_timeout", rename = "vm_stop_timeout")]
    pub stop_timeout: u64,
}

fn default_ttl() -> u64 {
    10800
}
fn default_ip_discovery_timeout() -> u64 {
    60
}
fn default_ssh_ready_timeout() -> u64 {
    30
}
fn default_vm_op_timeout() -> u64 {
    30
}

impl VmConfig {
    /// Load and validate configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, VirbyError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VirbyError::Configuration(format!(
                "failed to read configuration file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn parse(s: &str) -> Result<Self, VirbyError> {
        let mut config: Self = serde_json::from_str(s)
            .map_err(|e| VirbyError::Configuration(format!("invalid configuration JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), VirbyError> {
        if self.cores < 1 {
            return Err(VirbyError::Configuration(format!(
                "invalid cores setting: {}. Expected: positive integer",
                self.cores
            )));
        }
        if self.memory < 1024 {
            return Err(VirbyError::Configuration(format!(
                "invalid memory setting: {}. Expected: at least 1024 MiB",
                self.memory
            )));
        }
        if self.port < 1024 {
            return Err(VirbyError::Configuration(format!(
                "invalid port: {}. Expected: integer between 1024 and 65535",
                self.port
            )));
        }
        for (name, value) in [
            ("vm_pause_timeout", self.pause_timeout),
            ("vm_resume_timeout", self.resume_timeout),
            ("vm_stop_timeout", self.stop_timeout),
            ("ip_discovery_timeout", self.ip_discovery_timeout),
            ("ssh_ready_timeout", self.ssh_ready_timeout),
        ] {
            if value < 1 {
                return Err(VirbyError::Configuration(format!(
                    "invalid {name}: {value}. Expected: at least 1 second"
                )));
            }
        }

        // Shared directories must exist up front; a missing path would only
        // surface as an opaque vfkit failure at start time.
        let mut canonical = BTreeMap::new();
        for (tag, path) in &self.shared_dirs {
            let resolved = path.canonicalize().map_err(|_| {
                VirbyError::Configuration(format!(
                    "shared directory does not exist on host: {}",
                    path.display()
                ))
            })?;
            canonical.insert(tag.clone(), resolved);
        }
        self.shared_dirs = canonical;

        Ok(())
    }

    /// Working directory for all runtime artifacts: the
    /// `VIRBY_WORKING_DIRECTORY` env var, else the compiled-in default.
    pub fn working_directory(&self) -> PathBuf {
        std::env::var("VIRBY_WORKING_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(WORKING_DIRECTORY_DEFAULT))
    }

    /// Port of vfkit's REST control plane, always adjacent to the SSH port.
    pub fn vfkit_api_port(&self) -> u16 {
        self.port + 1
    }
}
