use std::path::Path;

use crate::config::VmConfig;
use crate::constants::{
    DIFF_DISK_FILE_NAME, EFI_VARIABLE_STORE_FILE_NAME, SERIAL_LOG_FILE_NAME,
    SSHD_KEYS_SHARED_DIR_NAME,
};

/// Mount tag under which the guest finds its sshd host keys.
const SSHD_KEYS_MOUNT_TAG: &str = "sshd-keys";

/// Build the vfkit argument vector from configuration.
///
/// The order is fixed; debug, rosetta, and configured shares append after
/// the base device set.
pub fn build_vfkit_command(config: &VmConfig, working_dir: &Path, mac_address: &str) -> Vec<String> {
    let efi_store = working_dir.join(EFI_VARIABLE_STORE_FILE_NAME);
    let diff_disk = working_dir.join(DIFF_DISK_FILE_NAME);
    let sshd_keys = working_dir.join(SSHD_KEYS_SHARED_DIR_NAME);

    let mut args = vec![
        "--cpus".to_string(),
        config.cores.to_string(),
        "--memory".to_string(),
        config.memory.to_string(),
        "--bootloader".to_string(),
        format!("efi,variable-store={},create", efi_store.display()),
        "--device".to_string(),
        format!("virtio-blk,path={}", diff_disk.display()),
        "--device".to_string(),
        format!(
            "virtio-fs,sharedDir={},mountTag={SSHD_KEYS_MOUNT_TAG}",
            sshd_keys.display()
        ),
        "--device".to_string(),
        format!("virtio-net,nat,mac={mac_address}"),
        "--restful-uri".to_string(),
        format!("tcp://localhost:{}", config.vfkit_api_port()),
        "--device".to_string(),
        "virtio-rng".to_string(),
        "--device".to_string(),
        "virtio-balloon".to_string(),
    ];

    if config.debug {
        let serial_log = working_dir.join(SERIAL_LOG_FILE_NAME);
        args.push("--device".to_string());
        args.push(format!("virtio-serial,logFilePath={}", serial_log.display()));
    }

    if config.rosetta {
        args.push("--device".to_string());
        args.push("rosetta,mountTag=rosetta".to_string());
    }

    for (tag, path) in &config.shared_dirs {
        args.push("--device".to_string());
        args.push(format!("virtio-fs,sharedDir={},mountTag={tag}", path.display()));
    }

    args
}
