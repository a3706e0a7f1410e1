//! Working-directory layout and compiled-in defaults.
//!
//! All runtime artifacts of one supervisor instance live beneath the working
//! directory; the file names here are the contract with the nix-darwin module
//! that provisions them.

/// Default working directory, overridable at build time via
/// `VIRBY_WORKING_DIRECTORY_DEFAULT`. The runtime env var
/// `VIRBY_WORKING_DIRECTORY` takes precedence over both.
pub const WORKING_DIRECTORY_DEFAULT: &str = match option_env!("VIRBY_WORKING_DIRECTORY_DEFAULT") {
    Some(v) => v,
    None => "/var/lib/virby",
};

/// macOS DHCP lease database written by the system's internal DHCP server.
pub const DHCPD_LEASES_FILE_PATH: &str = "/var/db/dhcpd_leases";

/// User account inside the guest that accepts build connections.
pub const VM_USER: &str = "builder";

/// Host name the guest announces in its DHCP requests.
pub const VM_HOST_NAME: &str = "virby-vm";

// SSH material under the working directory.
pub const SSH_USER_PRIVATE_KEY_FILE_NAME: &str = "ssh_user_ed25519_key";
pub const SSH_USER_PUBLIC_KEY_FILE_NAME: &str = "ssh_user_ed25519_key.pub";
pub const SSH_KNOWN_HOSTS_FILE_NAME: &str = "ssh_known_hosts";

/// Directory shared into the guest (virtio-fs) carrying its sshd host keys.
pub const SSHD_KEYS_SHARED_DIR_NAME: &str = "vm_sshd_keys";

// VM runtime files under the working directory.
pub const EFI_VARIABLE_STORE_FILE_NAME: &str = "efistore.nvram";
pub const DIFF_DISK_FILE_NAME: &str = "diff.img";
pub const SERIAL_LOG_FILE_NAME: &str = "serial.log";
pub const PID_FILE_NAME: &str = "vfkit.pid";

/// Socket name registered in the launchd service manifest.
pub const LAUNCHD_SOCKET_NAME: &str = "Listener";
