//! Device-mapper table parsing
//!
//! A table is a list of `<start> <length> <target> <args...>` lines, lengths
//! in 512-byte sectors. The parser keeps every target and can credit the
//! space each one consumes to its underlying devices, giving the `pe_map` of
//! a probed device-mapper volume.
//!
//! | Target            | Credited device |
//! |-------------------|-----------------|
//! | `linear`          | its device |
//! | `striped`         | every stripe device, equal shares |
//! | `snapshot`        | the COW device |
//! | `snapshot-origin` | the origin |
//! | `crypt`           | the backing device |
//! | `thin`, `thin-pool` | none |
//! | anything else     | every `major:minor` operand, equal shares |

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::model::PeMap;

/// One line of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTarget {
    pub start: u64,
    /// Length in sectors
    pub length: u64,
    pub target: String,
    pub args: Vec<String>,
}

/// A parsed device-mapper table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DmTable {
    pub targets: Vec<DmTarget>,
}

fn is_dev_number(operand: &str) -> bool {
    match operand.split_once(':') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

impl DmTable {
    /// Parse table text; blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut targets = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 3 {
                return Err(StorageError::invalid(format!(
                    "dm table line {}: expected '<start> <length> <target> <args>'",
                    lineno + 1
                )));
            }
            let number = |s: &str| {
                s.parse::<u64>().map_err(|_| {
                    StorageError::invalid(format!("dm table line {}: '{}' is not a number", lineno + 1, s))
                })
            };
            targets.push(DmTarget {
                start: number(fields[0])?,
                length: number(fields[1])?,
                target: fields[2].to_string(),
                args: fields[3..].iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(Self { targets })
    }

    /// Target names in table order.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.target.clone()).collect()
    }

    /// Total length in KiB.
    pub fn size_k(&self) -> u64 {
        self.targets.iter().map(|t| t.length).sum::<u64>() / 2
    }

    /// Extents of `pe_size_k` consumed per underlying device.
    ///
    /// `resolve` maps a `major:minor` operand to a device name; operands it
    /// cannot resolve are skipped.
    pub fn pe_map<F>(&self, pe_size_k: u64, mut resolve: F) -> PeMap
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut sectors: BTreeMap<String, u64> = BTreeMap::new();
        let mut credit = |operand: &str, amount: u64| {
            let device = if is_dev_number(operand) {
                resolve(operand)
            } else if operand.starts_with('/') {
                Some(operand.to_string())
            } else {
                None
            };
            match device {
                Some(dev) => *sectors.entry(dev).or_insert(0) += amount,
                None => debug!(operand, "Unresolved device operand skipped"),
            }
        };

        for t in &self.targets {
            let arg = |i: usize| t.args.get(i).map(String::as_str);
            match t.target.as_str() {
                "linear" => {
                    if let Some(dev) = arg(0) {
                        credit(dev, t.length);
                    }
                }
                "striped" => {
                    let stripes = arg(0).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
                    if stripes > 0 {
                        let share = t.length / stripes;
                        // pairs of <device> <offset> after <#stripes> <chunk size>
                        for i in 0..stripes as usize {
                            if let Some(dev) = arg(2 + 2 * i) {
                                credit(dev, share);
                            }
                        }
                    }
                }
                "snapshot" => {
                    if let Some(cow) = arg(1) {
                        credit(cow, t.length);
                    }
                }
                "snapshot-origin" => {
                    if let Some(origin) = arg(0) {
                        credit(origin, t.length);
                    }
                }
                "crypt" => {
                    if let Some(dev) = arg(3) {
                        credit(dev, t.length);
                    }
                }
                "thin" | "thin-pool" => {}
                other => {
                    warn!(dm_target = other, "Unknown device-mapper target, scanning operands");
                    let operands: Vec<&String> = t.args.iter().filter(|a| is_dev_number(a)).collect();
                    if !operands.is_empty() {
                        let share = t.length / operands.len() as u64;
                        for op in operands {
                            credit(op.as_str(), share);
                        }
                    }
                }
            }
        }

        let divisor = pe_size_k.max(1) * 2;
        sectors
            .into_iter()
            .map(|(dev, s)| (dev, s / divisor))
            .filter(|(_, pe)| *pe > 0)
            .collect()
    }
}

/// `/dev/<name>` for a `major:minor` pair, through `/dev/block` under `root`.
pub fn resolve_block_device(root: &Path, majmin: &str) -> Option<String> {
    let link = root.join("dev/block").join(majmin);
    let target = fs::read_link(link).ok()?;
    let name = target.file_name()?.to_str()?;
    Some(format!("/dev/{}", name))
}
