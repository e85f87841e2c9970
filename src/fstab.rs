//! fstab store
//!
//! Loads an fstab-format file, keeps comments and blank lines as they are,
//! and lets the executor add, update and remove entries. Entries are matched
//! by mount point, and by device spec when one is given. `flush` writes a
//! temporary file next to the target and renames it over.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::model::{Volume, VolumeDetail};
use crate::types::{FsType, MountBy};

/// One mount line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Device spec: path, `UUID=...`, `LABEL=...` or a share
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
    pub dump: u32,
    pub passno: u32,
}

impl FstabEntry {
    /// Parse one non-comment line; missing dump/passno read as 0.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0].starts_with('#') {
            return None;
        }
        Some(Self {
            device: fields[0].to_string(),
            mount_point: fields[1].to_string(),
            fs_type: fields[2].to_string(),
            options: fields[3].to_string(),
            dump: fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(0),
            passno: fields.get(5).and_then(|f| f.parse().ok()).unwrap_or(0),
        })
    }

    /// The entry describing how `volume` is mounted now.
    pub fn for_volume(volume: &Volume) -> Self {
        let (device, fs_type) = match &volume.detail {
            VolumeDetail::Nfs(nfs) => (nfs.share.clone(), FsType::Nfs.to_string()),
            VolumeDetail::Tmpfs => ("tmpfs".to_string(), FsType::Tmpfs.to_string()),
            _ => (
                device_spec(volume.mount_by, &volume.fs_device(), &volume.uuid, &volume.label),
                if volume.is_swap() { FsType::Swap.to_string() } else { volume.fs.to_string() },
            ),
        };
        let options = if volume.fstab_options.trim().is_empty() {
            "defaults".to_string()
        } else {
            volume.fstab_options.trim().to_string()
        };
        Self {
            device,
            passno: passno_for(&volume.mount, &fs_type),
            mount_point: volume.mount.clone(),
            fs_type,
            options,
            dump: 0,
        }
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<40} {:<15} {:<7} {:<15} {} {}",
            self.device, self.mount_point, self.fs_type, self.options, self.dump, self.passno
        )
    }
}

/// Device spec for a mount-by policy; falls back to the path when the
/// UUID or label is unknown.
pub fn device_spec(mount_by: MountBy, device: &str, uuid: &str, label: &str) -> String {
    match mount_by {
        MountBy::Uuid if !uuid.is_empty() => format!("UUID={}", uuid),
        MountBy::Label if !label.is_empty() => format!("LABEL={}", label),
        _ => device.to_string(),
    }
}

/// fsck pass: 1 for `/`, 0 for swap and network/virtual filesystems, else 2.
pub fn passno_for(mount_point: &str, fs_type: &str) -> u32 {
    match (mount_point, fs_type) {
        ("/", _) => 1,
        (_, "swap" | "nfs" | "nfs4" | "tmpfs") => 0,
        ("swap", _) => 0,
        _ => 2,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Verbatim(String),
    Entry(FstabEntry),
}

/// An fstab file held in memory.
#[derive(Debug, Clone)]
pub struct FstabStore {
    path: PathBuf,
    lines: Vec<Line>,
    dirty: bool,
}

impl FstabStore {
    /// Load `path`; a missing file is an empty table.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::parse(path, &text))
    }

    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| match FstabEntry::parse(line) {
                Some(entry) => Line::Entry(entry),
                None => Line::Verbatim(line.to_string()),
            })
            .collect();
        Self {
            path: path.into(),
            lines,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn entries(&self) -> impl Iterator<Item = &FstabEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Verbatim(_) => None,
        })
    }

    fn position(&self, mount_point: &str, device: Option<&str>) -> Option<usize> {
        self.lines.iter().position(|l| match l {
            Line::Entry(e) => {
                e.mount_point == mount_point && device.is_none_or(|d| e.device == d)
            }
            Line::Verbatim(_) => false,
        })
    }

    pub fn find(&self, mount_point: &str, device: Option<&str>) -> Option<&FstabEntry> {
        self.position(mount_point, device).and_then(|i| match &self.lines[i] {
            Line::Entry(e) => Some(e),
            Line::Verbatim(_) => None,
        })
    }

    /// Append `entry`, replacing an entry for the same mount point.
    ///
    /// Swap entries are keyed by device as well, so several can coexist.
    pub fn add(&mut self, entry: FstabEntry) {
        let device = (entry.mount_point == "swap").then_some(entry.device.clone());
        match self.position(&entry.mount_point, device.as_deref()) {
            Some(i) => self.lines[i] = Line::Entry(entry),
            None => self.lines.push(Line::Entry(entry)),
        }
        self.dirty = true;
    }

    /// Replace the matching entry; false when nothing matched.
    pub fn update(&mut self, mount_point: &str, device: Option<&str>, entry: FstabEntry) -> bool {
        match self.position(mount_point, device) {
            Some(i) => {
                self.lines[i] = Line::Entry(entry);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Drop the matching entry; false when nothing matched.
    pub fn remove(&mut self, mount_point: &str, device: Option<&str>) -> bool {
        match self.position(mount_point, device) {
            Some(i) => {
                self.lines.remove(i);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(text) => out.push_str(text),
                Line::Entry(e) => out.push_str(&e.to_string()),
            }
            out.push('\n');
        }
        out
    }

    /// Persist through a temporary file and rename.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".storplan-tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, self.render())?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        debug!(path = %self.path.display(), "fstab written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NfsInfo, VolumeKey};

    const SAMPLE: &str = "# /etc/fstab: static file system information\n\
                          \n\
                          UUID=1111 / ext4 defaults 0 1\n\
                          /dev/sda2 swap swap defaults 0 0\n";

    #[test]
    fn test_parse_keeps_comments() {
        let store = FstabStore::parse("/etc/fstab", SAMPLE);
        assert_eq!(store.entries().count(), 2);
        let rendered = store.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "# /etc/fstab: static file system information");
        assert_eq!(lines[1], "");
        assert!(lines[2].starts_with("UUID=1111"));
        assert_eq!(FstabEntry::parse(lines[3]).map(|e| e.passno), Some(0));
    }

    #[test]
    fn test_add_update_remove() {
        let mut store = FstabStore::parse("/etc/fstab", SAMPLE);
        let home = FstabEntry::parse("/dev/sdb1 /home xfs noatime 0 2").expect("entry"); // test: known-good input
        store.add(home);
        assert!(store.is_dirty());
        assert_eq!(store.find("/home", None).map(|e| e.fs_type.as_str()), Some("xfs"));

        let moved = FstabEntry::parse("/dev/sdb1 /srv xfs noatime 0 2").expect("entry"); // test: known-good input
        assert!(store.update("/home", Some("/dev/sdb1"), moved));
        assert!(store.find("/home", None).is_none());
        assert!(!store.remove("/srv", Some("/dev/other")));
        assert!(store.remove("/srv", None));
        assert_eq!(store.entries().count(), 2);
    }

    #[test]
    fn test_flush_writes_through_rename() {
        let dir = tempfile::tempdir().expect("tempdir"); // test: known-good input
        let path = dir.path().join("etc/fstab");
        let mut store = FstabStore::load(&path).expect("load missing"); // test: known-good input
        assert_eq!(store.entries().count(), 0);

        store.add(FstabEntry::parse("tmpfs /tmp tmpfs defaults 0 0").expect("entry")); // test: known-good input
        store.flush().expect("flush"); // test: known-good input

        let reloaded = FstabStore::load(&path).expect("reload"); // test: known-good input
        assert_eq!(reloaded.find("/tmp", None).map(|e| e.device.as_str()), Some("tmpfs"));
        assert!(!dir.path().join("etc/fstab.storplan-tmp").exists());
    }

    #[test]
    fn test_device_spec_falls_back_to_path() {
        assert_eq!(device_spec(MountBy::Uuid, "/dev/sda1", "abcd", ""), "UUID=abcd");
        assert_eq!(device_spec(MountBy::Uuid, "/dev/sda1", "", ""), "/dev/sda1");
        assert_eq!(device_spec(MountBy::Label, "/dev/sda1", "", "DATA"), "LABEL=DATA");
        assert_eq!(device_spec(MountBy::Device, "/dev/sda1", "abcd", "DATA"), "/dev/sda1");
    }

    #[test]
    fn test_passno() {
        assert_eq!(passno_for("/", "ext4"), 1);
        assert_eq!(passno_for("/home", "ext4"), 2);
        assert_eq!(passno_for("swap", "swap"), 0);
        assert_eq!(passno_for("/net", "nfs"), 0);
    }

    #[test]
    fn test_entry_for_volumes() {
        let mut root = Volume::partition("/dev/sda", 2, 1024, 4096)
            .with_fs(FsType::Ext4)
            .with_uuid("abcd");
        root.mount = "/".into();
        root.mount_by = MountBy::Uuid;
        let entry = FstabEntry::for_volume(&root);
        assert_eq!(entry.device, "UUID=abcd");
        assert_eq!((entry.fs_type.as_str(), entry.options.as_str(), entry.passno), ("ext4", "defaults", 1));

        let mut share = Volume::new(
            VolumeKey::Name("/net".into()),
            "srv:/export",
            0,
            VolumeDetail::Nfs(NfsInfo { share: "srv:/export".into() }),
        );
        share.mount = "/net".into();
        share.fstab_options = "ro,soft".into();
        let entry = FstabEntry::for_volume(&share);
        assert_eq!(entry.device, "srv:/export");
        assert_eq!((entry.fs_type.as_str(), entry.options.as_str(), entry.passno), ("nfs", "ro,soft", 0));
    }
}
