use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::constants::{DHCPD_LEASES_FILE_PATH, VM_HOST_NAME};
use crate::error::VirbyError;

/// One record from the host's DHCP lease database.
///
/// Lives only across a parse call; unknown keys are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpEntry {
    pub name: Option<String>,
    pub ip_address: Option<String>,
    /// Stored normalised (lower-case, per-octet leading zero stripped).
    pub hw_address: Option<String>,
    pub identifier: Option<String>,
    pub lease: Option<String>,
}

/// Normalise a MAC address so hypervisor-emitted and lease-file forms
/// compare equal: lower-case, and the leading zero of each two-digit octet
/// stripped (`02:94:0A:…` -> `2:94:a:…`).
pub fn normalize_mac(mac: &str) -> String {
    mac.to_ascii_lowercase()
        .split(':')
        .map(|octet| octet.strip_prefix('0').filter(|rest| !rest.is_empty()).unwrap_or(octet))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse the lease database: records are delimited by `{`/`}` lines, inner
/// lines are `key=value`. The `hw_address` value may carry a `1,` type
/// prefix, which is stripped before normalisation.
pub fn parse_leases(content: &str) -> Vec<DhcpEntry> {
    let mut entries = Vec::new();
    let mut current: Option<DhcpEntry> = None;

    for line in content.lines() {
        let line = line.trim();

        match line {
            "{" => {
                current = Some(DhcpEntry::default());
                continue;
            }
            "}" => {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                continue;
            }
            _ => {}
        }

        let Some(entry) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "name" => entry.name = Some(value.to_string()),
            "ip_address" => entry.ip_address = Some(value.to_string()),
            "hw_address" => {
                let mac = value.strip_prefix("1,").unwrap_or(value);
                entry.hw_address = Some(normalize_mac(mac));
            }
            "identifier" => entry.identifier = Some(value.to_string()),
            "lease" => entry.lease = Some(value.to_string()),
            _ => {}
        }
    }

    entries
}

/// Resolves the guest's MAC to its DHCP-assigned IPv4 address.
///
/// Parsing is cached keyed on the lease file's mtime; the cache is dropped
/// on any read error. A missing or unreadable file is not an error: the
/// guest simply has no lease yet.
#[derive(Debug)]
pub struct LeaseWatcher {
    mac_address: String,
    leases_path: PathBuf,
    cache: Option<(SystemTime, Vec<DhcpEntry>)>,
}

impl LeaseWatcher {
    pub fn new(mac_address: &str) -> Self {
        Self::with_path(mac_address, Path::new(DHCPD_LEASES_FILE_PATH))
    }

    pub fn with_path(mac_address: &str, leases_path: &Path) -> Self {
        Self {
            mac_address: normalize_mac(mac_address),
            leases_path: leases_path.to_path_buf(),
            cache: None,
        }
    }

    /// Look up the IP currently leased to the watched MAC.
    pub async fn lookup(&mut self) -> Result<Option<String>, VirbyError> {
        let mtime = match tokio::fs::metadata(&self.leases_path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                debug!(path = %self.leases_path.display(), error = %e, "DHCP leases file not readable");
                self.cache = None;
                return Ok(None);
            }
        };

        let fresh = matches!((&self.cache, mtime),
            (Some((cached_mtime, _)), Some(current)) if *cached_mtime == current);
        if !fresh {
            let raw = match tokio::fs::read(&self.leases_path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(path = %self.leases_path.display(), error = %e, "failed to read DHCP leases file");
                    self.cache = None;
                    return Ok(None);
                }
            };
            let content = String::from_utf8(raw).map_err(|e| {
                self.cache = None;
                VirbyError::IpDiscovery(format!(
                    "DHCP leases file {} is not valid UTF-8: {e}",
                    self.leases_path.display()
                ))
            })?;
            let entries = parse_leases(&content);
            self.cache = Some((mtime.unwrap_or(SystemTime::UNIX_EPOCH), entries));
        }

        let Some((_, entries)) = &self.cache else {
            return Ok(None);
        };
        let matched: Vec<&DhcpEntry> = entries
            .iter()
            .filter(|e| e.hw_address.as_deref() == Some(self.mac_address.as_str()))
            .collect();
        // A lease file rewritten across guest reboots can carry several
        // records for one MAC; prefer the record announced under the guest's
        // host name.
        let entry = matched
            .iter()
            .find(|e| e.name.as_deref() == Some(VM_HOST_NAME))
            .copied()
            .or_else(|| matched.first().copied());
        let found = entry.and_then(|e| e.ip_address.clone());

        match &found {
            Some(ip) => debug!(mac = %self.mac_address, ip = %ip, "found DHCP lease"),
            None => debug!(mac = %self.mac_address, "no DHCP lease for MAC"),
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> String {
        format!(
            "{{\n\
             \tname={VM_HOST_NAME}\n\
             \tip_address=192.168.64.7\n\
             \thw_address=1,2:94:ab:cd:ef:12\n\
             \tidentifier=1,2:94:ab:cd:ef:12\n\
             \tlease=0x66f1a2b3\n\
             }}\n\
             {{\n\
             \tname=other-vm\n\
             \tip_address=192.168.64.9\n\
             \thw_address=1,aa:bb:c:d:e:f\n\
             \tlease=0x66f1a2b4\n\
             }}\n"
        )
    }

    #[test]
    fn test_parse_sample_leases() {
        let entries = parse_leases(&sample());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name.as_deref(), Some(VM_HOST_NAME));
        assert_eq!(entries[0].ip_address.as_deref(), Some("192.168.64.7"));
        assert_eq!(entries[0].hw_address.as_deref(), Some("2:94:ab:cd:ef:12"));
        assert_eq!(entries[0].identifier.as_deref(), Some("1,2:94:ab:cd:ef:12"));
        assert_eq!(entries[0].lease.as_deref(), Some("0x66f1a2b3"));
        assert_eq!(entries[1].hw_address.as_deref(), Some("aa:bb:c:d:e:f"));
    }

    #[test]
    fn test_parse_ignores_junk_outside_records() {
        let entries = parse_leases("garbage\nip_address=10.0.0.1\n{\nname=x\n}\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.as_deref(), Some("x"));
        assert_eq!(entries[0].ip_address, None);
    }

    #[test]
    fn test_normalize_strips_case_and_leading_zeros() {
        assert_eq!(normalize_mac("02:94:AB:0D:EF:02"), "2:94:ab:d:ef:2");
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:ff"), "aa:bb:cc:dd:ee:ff");
        // "00" collapses to "0", not the empty string.
        assert_eq!(normalize_mac("00:01:02:03:04:05"), "0:1:2:3:4:5");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for mac in ["02:94:AB:0D:EF:02", "2:94:a:b:c:d", "00:00:00:00:00:00"] {
            let once = normalize_mac(mac);
            assert_eq!(normalize_mac(&once), once);
        }
    }

    #[test]
    fn test_round_trip_preserves_recognised_fields() {
        let entries = parse_leases(&sample());

        let rendered: String = entries
            .iter()
            .map(|e| {
                let mut block = String::from("{\n");
                if let Some(v) = &e.name {
                    block.push_str(&format!("\tname={v}\n"));
                }
                if let Some(v) = &e.ip_address {
                    block.push_str(&format!("\tip_address={v}\n"));
                }
                if let Some(v) = &e.hw_address {
                    block.push_str(&format!("\thw_address={v}\n"));
                }
                if let Some(v) = &e.identifier {
                    block.push_str(&format!("\tidentifier={v}\n"));
                }
                if let Some(v) = &e.lease {
                    block.push_str(&format!("\tlease={v}\n"));
                }
                block.push_str("}\n");
                block
            })
            .collect();

        assert_eq!(parse_leases(&rendered), entries);
    }

    #[tokio::test]
    async fn test_lookup_missing_file_returns_none() {
        let mut watcher =
            LeaseWatcher::with_path("02:94:ab:cd:ef:12", Path::new("/nonexistent/dhcpd_leases"));
        assert_eq!(watcher.lookup().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_matches_hypervisor_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd_leases");
        std::fs::write(&path, sample()).unwrap();

        // Hypervisor emits zero-padded upper/lower mixed form.
        let mut watcher = LeaseWatcher::with_path("02:94:AB:CD:EF:12", &path);
        assert_eq!(
            watcher.lookup().await.unwrap().as_deref(),
            Some("192.168.64.7")
        );
    }

    #[tokio::test]
    async fn test_lookup_unknown_mac_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd_leases");
        std::fs::write(&path, sample()).unwrap();

        let mut watcher = LeaseWatcher::with_path("02:94:00:00:00:01", &path);
        assert_eq!(watcher.lookup().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_prefers_record_named_after_guest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd_leases");
        // Two records for the same MAC: a stale one first, then the record
        // the guest announced under its own host name.
        std::fs::write(
            &path,
            format!(
                "{{\n\tname=stale-host\n\tip_address=192.168.64.3\n\thw_address=1,2:94:a:b:c:d\n}}\n\
                 {{\n\tname={VM_HOST_NAME}\n\tip_address=192.168.64.4\n\thw_address=1,2:94:a:b:c:d\n}}\n"
            ),
        )
        .unwrap();

        let mut watcher = LeaseWatcher::with_path("02:94:0A:0B:0C:0D", &path);
        assert_eq!(
            watcher.lookup().await.unwrap().as_deref(),
            Some("192.168.64.4")
        );
    }

    #[tokio::test]
    async fn test_cache_populated_then_cleared_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd_leases");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample().as_bytes()).unwrap();
        drop(f);

        let mut watcher = LeaseWatcher::with_path("02:94:ab:cd:ef:12", &path);
        watcher.lookup().await.unwrap();
        assert!(watcher.cache.is_some());

        std::fs::remove_file(&path).unwrap();
        assert_eq!(watcher.lookup().await.unwrap(), None);
        assert!(watcher.cache.is_none());
    }
}
