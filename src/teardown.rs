//! Best-effort cleanup after an interrupted creator run.
//!
//! The creator tool loop-mounts the image it is assembling; when it is
//! killed mid-flight it leaves mounts, device-mapper partition nodes and
//! loop devices behind. This module re-derives what needs cleaning from the
//! host's mount table rather than trusting the tool, and unwinds it in
//! dependency order: nested mounts first, then the partition mappings, then
//! the loop devices themselves.
//!
//! Every step is attempted even when an earlier one fails; nothing here ever
//! raises past [`cleanup_after_creator`]. The point is to leave the host
//! usable for the next build attempt.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::process::Cmd;

/// Directory name prefix of the creator tool's working directories.
const CREATOR_WORK_DIR_PREFIX: &str = "imgcreate-";

/// One mounted filesystem, as read from the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Backing device ("/dev/mapper/loop0p1", "proc", ...).
    pub device: String,
    pub path: PathBuf,
}

/// A loop device implicated by one or more mounts, with the partition
/// numbers of its device-mapper nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    /// Loop device path, e.g. "/dev/loop0".
    pub device: String,
    /// Partition numbers, ascending, deduplicated.
    pub partitions: Vec<u32>,
}

/// Tear down everything an interrupted creator run left under
/// `build_tmp_root`.
///
/// The creator process is signalled and reaped first so it cannot race the
/// filesystem cleanup. Failures are logged and skipped; this function never
/// returns an error.
pub fn cleanup_after_creator(build_tmp_root: &Path, creator_pid: i32) {
    println!("Cleaning up after interrupted appliance creator (pid {creator_pid})...");

    let pid = Pid::from_raw(creator_pid);
    if let Err(errno) = kill(pid, Signal::SIGTERM) {
        eprintln!("warning: could not signal creator process {creator_pid}: {errno}");
    }
    if let Err(errno) = waitpid(pid, None) {
        eprintln!("warning: could not reap creator process {creator_pid}: {errno}");
    }

    for dir in creator_work_dirs(build_tmp_root) {
        cleanup_work_dir(&dir);
    }

    println!("Cleanup finished.");
}

/// Creator working directories under the build tmp root, sorted.
fn creator_work_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("warning: cannot scan '{}': {e}", root.display());
            return dirs;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if name.starts_with(CREATOR_WORK_DIR_PREFIX) && path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    dirs
}

fn cleanup_work_dir(dir: &Path) {
    println!("Unwinding mounts under '{}'", dir.display());

    let output = match Command::new("mount").output() {
        Ok(output) => output,
        Err(e) => {
            eprintln!("warning: could not list mounts: {e}");
            return;
        }
    };
    let table = String::from_utf8_lossy(&output.stdout);
    let mounts = mounts_under(&parse_mount_table(&table), dir);

    for path in unmount_order(&mounts) {
        if let Err(e) = Cmd::new("umount").arg("-d").arg_path(&path).run() {
            eprintln!("warning: {e}");
        }
    }

    for loop_dev in implicated_loops(&mounts) {
        if let Err(e) = Cmd::new("kpartx").arg("-d").arg(&loop_dev.device).run() {
            eprintln!("warning: {e}");
        }
        if let Err(e) = Cmd::new("losetup").arg("-d").arg(&loop_dev.device).run() {
            eprintln!("warning: {e}");
        }
        // Residual partition nodes sometimes survive kpartx -d; the node for
        // partition M of /dev/loopN is /dev/loopN<M>.
        for part in &loop_dev.partitions {
            let node = format!("{}{}", loop_dev.device, part);
            if Path::new(&node).exists() {
                if let Err(e) = fs::remove_file(&node) {
                    eprintln!("warning: could not remove '{node}': {e}");
                }
            }
        }
    }
}

/// Parse `mount` output lines of the form `DEV on PATH type FS (OPTS)`.
pub fn parse_mount_table(output: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 || tokens[1] != "on" {
            continue;
        }
        entries.push(MountEntry {
            device: tokens[0].to_string(),
            path: PathBuf::from(tokens[2]),
        });
    }
    entries
}

/// Mounts whose path falls under `root`.
pub fn mounts_under(entries: &[MountEntry], root: &Path) -> Vec<MountEntry> {
    entries
        .iter()
        .filter(|entry| entry.path.starts_with(root))
        .cloned()
        .collect()
}

/// Unmount order for a set of mounts: deepest path first, so nested mounts
/// never block an ancestor's unmount. Within one depth, later-discovered
/// mounts come first (they were stacked later). This ordering is a
/// correctness requirement, not an optimization.
pub fn unmount_order(mounts: &[MountEntry]) -> Vec<PathBuf> {
    let mut indexed: Vec<(usize, &MountEntry)> = mounts.iter().enumerate().collect();
    indexed.sort_by_key(|(i, entry)| (Reverse(entry.path.components().count()), Reverse(*i)));

    let mut order = Vec::new();
    for (_, entry) in indexed {
        if !order.contains(&entry.path) {
            order.push(entry.path.clone());
        }
    }
    order
}

/// Loop devices backing the given mounts, via their device-mapper partition
/// nodes. Each loop device appears exactly once, in first-seen order, no
/// matter how many mounts reference it.
pub fn implicated_loops(mounts: &[MountEntry]) -> Vec<LoopDevice> {
    let mut loops: Vec<LoopDevice> = Vec::new();
    for entry in mounts {
        let Some((device, partition)) = loop_partition(&entry.device) else {
            continue;
        };
        match loops.iter_mut().find(|l| l.device == device) {
            Some(existing) => {
                if !existing.partitions.contains(&partition) {
                    existing.partitions.push(partition);
                    existing.partitions.sort_unstable();
                }
            }
            None => loops.push(LoopDevice {
                device,
                partitions: vec![partition],
            }),
        }
    }
    loops
}

/// Derive (loop device, partition number) from a device-mapper node path.
///
/// `/dev/mapper/loop0p1` → `("/dev/loop0", 1)`. This relation is modeled
/// explicitly so the rest of teardown never string-matches device names.
fn loop_partition(device: &str) -> Option<(String, u32)> {
    let name = device.strip_prefix("/dev/mapper/loop")?;
    let (index, partition) = name.split_once('p')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let partition: u32 = partition.parse().ok()?;
    Some((format!("/dev/loop{index}"), partition))
}
