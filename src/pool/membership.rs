//! Operations that need the pool and its volumes together: member removal
//! with migration, overcommit rebalance and the consistency check.

use std::collections::BTreeMap;
use tracing::{debug, info};

use super::ExtentPool;
use crate::error::{Result, StorageError};
use crate::model::{Extentable, PeMap, Stripable, Volume};

/// Remove `device` from the pool, migrating the extents volumes hold on it.
///
/// Migration releases each volume's extents on the member and allocates the
/// same count elsewhere with the volume's stripe count. On any failure the
/// pool and every map are restored; a volume that does not fit is reported
/// as `InsufficientSpace` for the whole member, other errors pass through.
/// A committed member moves to `pv_remove`; a staged one is dropped.
pub fn try_remove_member(pool: &mut ExtentPool, volumes: &mut [Volume], device: &str) -> Result<()> {
    let committed = pool.pv.iter().any(|m| m.device == device);
    let member = pool
        .member(device)
        .cloned()
        .ok_or_else(|| StorageError::MemberNotFound(device.to_string()))?;

    if member.used_pe() > 0 {
        let pool_before = pool.clone();
        let maps_before: Vec<(usize, PeMap)> = volumes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.detail.lv_extents().map(|lv| (i, lv.pe_map.clone())))
            .collect();

        if let Err(e) = migrate_off(pool, volumes, device) {
            *pool = pool_before;
            for (i, map) in maps_before {
                if let Some(lv) = volumes[i].detail.lv_extents_mut() {
                    lv.pe_map = map;
                }
            }
            debug!(device, error = %e, "Member migration failed, pool restored");
            return Err(match e {
                StorageError::InsufficientSpace { .. } => StorageError::InsufficientSpace {
                    requested: member.used_pe(),
                    available: pool.free_pe.saturating_sub(member.free_pe),
                },
                other => other,
            });
        }
    }

    let removed = if committed {
        let pos = pool.pv.iter().position(|m| m.device == device);
        pos.map(|p| pool.pv.remove(p))
    } else {
        let pos = pool.pv_add.iter().position(|m| m.device == device);
        pos.map(|p| pool.pv_add.remove(p))
    };
    let Some(removed) = removed else {
        return Err(StorageError::MemberNotFound(device.to_string()));
    };
    pool.num_pe -= removed.num_pe;
    pool.free_pe -= removed.free_pe;
    if committed {
        pool.pv_remove.push(removed);
    }
    info!(device, committed, "Member removed from pool");
    Ok(())
}

fn migrate_off(pool: &mut ExtentPool, volumes: &mut [Volume], device: &str) -> Result<()> {
    for volume in volumes.iter_mut().filter(|v| !v.deleted) {
        let stripes = volume.detail.stripes();
        let Some(lv) = volume.detail.lv_extents_mut() else {
            continue;
        };
        let moved = pool.release_on_member(&mut lv.pe_map, device)?;
        if moved == 0 {
            continue;
        }
        pool.allocate_excluding(&mut lv.pe_map, moved, stripes, Some(device))?;
        // striped placement reserves whole rounds; give back the overshoot
        let mapped: u64 = lv.pe_map.values().sum();
        if mapped > lv.le {
            pool.reclaim(&mut lv.pe_map, mapped - lv.le)?;
        }
        debug!(volume = %volume.device, moved, "Extents migrated");
    }
    Ok(())
}

/// Scale back pending creations and extensions that do not fit.
///
/// `available_pe` is the free extent count reported by the system. Extents
/// of committed volumes that are being deleted or shrunk count as available.
/// Each reduction is a whole number of stripe rounds. Returns the shortfall.
pub fn rebalance_on_overcommit(
    pool: &mut ExtentPool,
    volumes: &mut [Volume],
    available_pe: u64,
) -> Result<u64> {
    let pe = pool.pe_size_k.max(1);
    let mut soon_freed = 0;
    let mut pending: Vec<(usize, u64)> = Vec::new();

    for (i, v) in volumes.iter().enumerate() {
        let Some(lv) = v.detail.lv_extents() else {
            continue;
        };
        let orig_le = v.orig_size_k / pe;
        if v.deleted {
            if !v.created {
                soon_freed += orig_le;
            }
        } else if v.created {
            pending.push((i, lv.le));
        } else if lv.le > orig_le {
            pending.push((i, lv.le - orig_le));
        } else if v.size_k < v.orig_size_k {
            soon_freed += orig_le - lv.le;
        }
    }

    let requested: u64 = pending.iter().map(|(_, inc)| inc).sum();
    let budget = available_pe + soon_freed;
    if requested <= budget {
        return Ok(0);
    }

    let shortfall = requested - budget;
    info!(requested, budget, shortfall, "Pool overcommitted, scaling back pending volumes");
    pending.sort_by(|a, b| b.1.cmp(&a.1));

    let mut remaining_short = shortfall;
    let mut remaining_total = requested;
    for (i, increase) in pending {
        if remaining_total == 0 {
            break;
        }
        let stripes = u64::from(volumes[i].detail.stripes().max(1));
        let share = remaining_short * increase / remaining_total;
        let reduction = share
            .div_ceil(stripes)
            .saturating_mul(stripes)
            .min(remaining_short.div_ceil(stripes).saturating_mul(stripes))
            .min(increase / stripes * stripes);
        remaining_short = remaining_short.saturating_sub(reduction);
        remaining_total -= increase;
        if reduction == 0 {
            continue;
        }
        let volume = &mut volumes[i];
        let Some(lv) = volume.detail.lv_extents_mut() else {
            continue;
        };
        pool.reclaim(&mut lv.pe_map, reduction)?;
        lv.le -= reduction;
        volume.size_k = lv.le * pe;
        debug!(volume = %volume.device, reduction, le = lv.le, "Pending volume scaled back");
    }
    Ok(shortfall)
}

/// Verify per-member and pool totals against the volumes' maps.
pub fn check_consistency(pool: &ExtentPool, volumes: &[Volume]) -> Result<()> {
    let mut mapped: BTreeMap<&str, u64> = BTreeMap::new();
    for v in volumes.iter().filter(|v| !v.deleted) {
        if let Some(lv) = v.detail.lv_extents() {
            for (dev, count) in &lv.pe_map {
                *mapped.entry(dev.as_str()).or_insert(0) += count;
            }
        }
    }

    for dev in mapped.keys() {
        if pool.member(dev).is_none() {
            return Err(StorageError::pe_map(format!("{} is mapped but not a member", dev)));
        }
    }

    let members = pool.pv.iter().chain(pool.pv_add.iter());
    let mut free_total = 0;
    let mut num_total = 0;
    for m in members {
        let used = mapped.get(m.device.as_str()).copied().unwrap_or(0);
        if m.free_pe > m.num_pe || m.used_pe() != used {
            return Err(StorageError::pe_map(format!(
                "{}: {} of {} extents free but {} mapped",
                m.device, m.free_pe, m.num_pe, used
            )));
        }
        free_total += m.free_pe;
        num_total += m.num_pe;
    }

    if free_total != pool.free_pe || num_total != pool.num_pe {
        return Err(StorageError::pe_map(format!(
            "pool totals {}/{} do not match members {}/{}",
            pool.free_pe, pool.num_pe, free_total, num_total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LvExtents;
    use crate::pool::PvInfo;

    const PE: u64 = 4096;

    fn lv(pool: &mut ExtentPool, name: &str, le: u64, stripes: u32) -> Volume {
        let mut ext = LvExtents::new(stripes, 64);
        pool.allocate(&mut ext.pe_map, le, stripes).expect("allocate"); // test: known-good input
        ext.le = le;
        Volume::logical("/dev/vg", name, PE, ext)
    }

    #[test]
    fn test_remove_free_member_without_migration() {
        let mut pool = ExtentPool::with_members(PE, vec![PvInfo::new("/dev/sda1", 10)]);
        pool.add_member(PvInfo::new("/dev/sdb1", 5)).expect("add"); // test: known-good input
        let mut vols = Vec::new();
        try_remove_member(&mut pool, &mut vols, "/dev/sdb1").expect("remove"); // test: known-good input
        assert!(pool.pv_add.is_empty());
        assert!(pool.pv_remove.is_empty());
        assert_eq!(pool.free_pe, 10);
    }

    #[test]
    fn test_remove_member_migrates_extents() {
        let mut pool = ExtentPool::with_members(
            PE,
            vec![PvInfo::new("/dev/sda1", 10), PvInfo::new("/dev/sdb1", 10)],
        );
        let mut vols = vec![lv(&mut pool, "root", 6, 1)];
        try_remove_member(&mut pool, &mut vols, "/dev/sda1").expect("migrate"); // test: known-good input

        let map = &vols[0].detail.lv_extents().expect("lv").pe_map; // test: known-good input
        assert_eq!(map.get("/dev/sdb1"), Some(&6));
        assert!(map.get("/dev/sda1").is_none());
        assert_eq!(pool.pv_remove.len(), 1);
        assert_eq!(pool.free_pe, 4);
        check_consistency(&pool, &vols).expect("consistent"); // test: known-good input
    }

    #[test]
    fn test_failed_migration_restores_everything() {
        let mut pool = ExtentPool::with_members(
            PE,
            vec![PvInfo::new("/dev/sda1", 10), PvInfo::new("/dev/sdb1", 3)],
        );
        let mut vols = vec![lv(&mut pool, "root", 8, 1)];
        let pool_before = pool.clone();
        let vols_before = vols.clone();

        let err = try_remove_member(&mut pool, &mut vols, "/dev/sda1").unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { .. }));
        assert_eq!(pool, pool_before);
        assert_eq!(vols, vols_before);
    }

    #[test]
    fn test_corrupt_map_during_migration_is_not_a_space_error() {
        let mut pool = ExtentPool::with_members(
            PE,
            vec![PvInfo::new("/dev/sda1", 10), PvInfo::new("/dev/sdb1", 10)],
        );
        let mut root = lv(&mut pool, "root", 4, 1);
        if let Some(ext) = root.detail.lv_extents_mut() {
            ext.pe_map.insert("/dev/ghost".into(), 1);
            ext.le = 1;
        }
        let mut vols = vec![root];
        let pool_before = pool.clone();
        let vols_before = vols.clone();

        let err = try_remove_member(&mut pool, &mut vols, "/dev/sda1").unwrap_err();
        assert!(matches!(err, StorageError::PeMapInconsistent(_)));
        assert_eq!(pool, pool_before);
        assert_eq!(vols, vols_before);
    }

    #[test]
    fn test_remove_unknown_member() {
        let mut pool = ExtentPool::with_members(PE, vec![PvInfo::new("/dev/sda1", 10)]);
        let err = try_remove_member(&mut pool, &mut [], "/dev/sdq1").unwrap_err();
        assert!(matches!(err, StorageError::MemberNotFound(_)));
    }

    #[test]
    fn test_rebalance_scales_largest_first() {
        let mut pool = ExtentPool::with_members(PE, vec![PvInfo::new("/dev/sda1", 100)]);
        let mut vols = vec![
            lv(&mut pool, "big", 60, 1).into_pending(),
            lv(&mut pool, "small", 30, 1).into_pending(),
        ];
        // the system reports only 60 extents free: shortfall 30
        let taken = rebalance_on_overcommit(&mut pool, &mut vols, 60).expect("rebalance"); // test: known-good input
        assert_eq!(taken, 30);
        let big = vols[0].detail.lv_extents().expect("lv"); // test: known-good input
        let small = vols[1].detail.lv_extents().expect("lv"); // test: known-good input
        assert_eq!(big.le, 40);
        assert_eq!(small.le, 20);
        assert_eq!(vols[0].size_k, 40 * PE);
        check_consistency(&pool, &vols).expect("consistent"); // test: known-good input
    }

    #[test]
    fn test_rebalance_keeps_striped_volumes_whole_rounds() {
        let mut pool = ExtentPool::with_members(
            PE,
            vec![PvInfo::new("/dev/sda1", 100), PvInfo::new("/dev/sdb1", 100)],
        );
        let mut vols = vec![
            lv(&mut pool, "a", 30, 2).into_pending(),
            lv(&mut pool, "b", 30, 2).into_pending(),
        ];
        // shortfall 15 split over two 2-way striped volumes
        let shortfall = rebalance_on_overcommit(&mut pool, &mut vols, 45).expect("rebalance"); // test: known-good input
        assert_eq!(shortfall, 15);
        let les: Vec<u64> = vols.iter().filter_map(|v| v.detail.lv_extents()).map(|lv| lv.le).collect();
        assert_eq!(les, vec![22, 22]);
        assert!(les.iter().sum::<u64>() <= 45);
        check_consistency(&pool, &vols).expect("consistent"); // test: known-good input
    }

    #[test]
    fn test_rebalance_counts_deleted_volumes() {
        let mut pool = ExtentPool::with_members(PE, vec![PvInfo::new("/dev/sda1", 100)]);
        let mut old = lv(&mut pool, "old", 40, 1);
        old.deleted = true;
        let mut vols = vec![old, lv(&mut pool, "new", 50, 1).into_pending()];
        let taken = rebalance_on_overcommit(&mut pool, &mut vols, 10).expect("rebalance"); // test: known-good input
        assert_eq!(taken, 0);
    }

    #[test]
    fn test_consistency_detects_drift() {
        let mut pool = ExtentPool::with_members(PE, vec![PvInfo::new("/dev/sda1", 10)]);
        let vols = vec![lv(&mut pool, "root", 4, 1)];
        check_consistency(&pool, &vols).expect("consistent"); // test: known-good input
        pool.pv[0].free_pe += 1;
        assert!(check_consistency(&pool, &vols).is_err());
    }
}
