//! Extent-pool allocator
//!
//! An extent pool (an LVM volume group) hands out fixed-size extents from its
//! member devices to logical volumes. Each logical volume records how many
//! extents it consumes on each member in its `pe_map`; the pool records the
//! free count of every member and its own total.
//!
//! # Invariant
//!
//! For every member: `num_pe - free_pe` equals the sum of that member's
//! entries over all non-deleted volumes. The pool's `free_pe` is the sum of
//! the members' `free_pe`. Every operation here either keeps this true or
//! fails without changing anything.
//!
//! # Design
//!
//! - **Plan, then apply**: allocation works on copies of the free counts and
//!   touches the pool only once the whole request fits
//! - **Deterministic**: members are walked in list order (`pv`, then
//!   `pv_add`), maps in ascending member name
//! - **Best effort striping**: the striped check is a feasibility
//!   approximation, not a volume manager's placement policy

mod membership;

pub use membership::{check_consistency, rebalance_on_overcommit, try_remove_member};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::model::PeMap;

/// One member device of an extent pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvInfo {
    pub device: String,
    pub num_pe: u64,
    pub free_pe: u64,
}

impl PvInfo {
    /// An unused member with `num_pe` extents.
    pub fn new(device: impl Into<String>, num_pe: u64) -> Self {
        Self {
            device: device.into(),
            num_pe,
            free_pe: num_pe,
        }
    }

    pub fn used_pe(&self) -> u64 {
        self.num_pe.saturating_sub(self.free_pe)
    }
}

/// Extent bookkeeping of a pool container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPool {
    pub pe_size_k: u64,
    pub num_pe: u64,
    pub free_pe: u64,
    /// Committed members
    #[serde(default)]
    pub pv: Vec<PvInfo>,
    /// Members staged to join
    #[serde(default)]
    pub pv_add: Vec<PvInfo>,
    /// Members staged to leave
    #[serde(default)]
    pub pv_remove: Vec<PvInfo>,
}

impl ExtentPool {
    pub fn new(pe_size_k: u64) -> Self {
        Self {
            pe_size_k,
            num_pe: 0,
            free_pe: 0,
            pv: Vec::new(),
            pv_add: Vec::new(),
            pv_remove: Vec::new(),
        }
    }

    /// A committed pool over `members`, totals derived from them.
    pub fn with_members(pe_size_k: u64, members: Vec<PvInfo>) -> Self {
        let mut pool = Self::new(pe_size_k);
        pool.num_pe = members.iter().map(|m| m.num_pe).sum();
        pool.free_pe = members.iter().map(|m| m.free_pe).sum();
        pool.pv = members;
        pool
    }

    /// Extents needed to hold `size_k` KiB, rounded up.
    pub fn extents_for_size(&self, size_k: u64) -> u64 {
        if self.pe_size_k == 0 {
            return 0;
        }
        size_k.div_ceil(self.pe_size_k)
    }

    /// Extents for a logical volume: whole extents, then a stripe multiple.
    ///
    /// A size whose extent count cannot be represented is `InsufficientSpace`.
    pub fn extents_for_volume(&self, size_k: u64, stripes: u32) -> Result<u64> {
        let stripes = u64::from(stripes.max(1));
        let extents = self.extents_for_size(size_k);
        extents
            .div_ceil(stripes)
            .checked_mul(stripes)
            .ok_or(StorageError::InsufficientSpace {
                requested: extents,
                available: self.free_pe,
            })
    }

    /// Member by device, committed members first.
    pub fn member(&self, device: &str) -> Option<&PvInfo> {
        self.pv
            .iter()
            .chain(self.pv_add.iter())
            .find(|m| m.device == device)
    }

    fn member_mut(&mut self, device: &str) -> Option<&mut PvInfo> {
        self.pv
            .iter_mut()
            .chain(self.pv_add.iter_mut())
            .find(|m| m.device == device)
    }

    /// Number of allocation slots (`pv` followed by `pv_add`).
    fn slot_count(&self) -> usize {
        self.pv.len() + self.pv_add.len()
    }

    fn slot(&self, index: usize) -> &PvInfo {
        if index < self.pv.len() {
            &self.pv[index]
        } else {
            &self.pv_add[index - self.pv.len()]
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut PvInfo {
        let committed = self.pv.len();
        if index < committed {
            &mut self.pv[index]
        } else {
            &mut self.pv_add[index - committed]
        }
    }

    /// Stage a new member. A member staged to leave is taken back instead.
    pub fn add_member(&mut self, member: PvInfo) -> Result<()> {
        if self.member(&member.device).is_some() {
            return Err(StorageError::in_use(member.device, "extent pool member"));
        }
        if let Some(pos) = self.pv_remove.iter().position(|m| m.device == member.device) {
            let back = self.pv_remove.remove(pos);
            debug!(device = %back.device, "Member taken back from staged removal");
            self.num_pe += back.num_pe;
            self.free_pe += back.free_pe;
            self.pv.push(back);
            return Ok(());
        }
        debug!(device = %member.device, num_pe = member.num_pe, "Member staged to join");
        self.num_pe += member.num_pe;
        self.free_pe += member.free_pe;
        self.pv_add.push(member);
        Ok(())
    }

    /// Reserve `count` extents for a volume and record them in `map`.
    pub fn allocate(&mut self, map: &mut PeMap, count: u64, stripes: u32) -> Result<()> {
        self.allocate_excluding(map, count, stripes, None)
    }

    /// [`allocate`](Self::allocate) without touching the member `exclude`.
    pub fn allocate_excluding(
        &mut self,
        map: &mut PeMap,
        count: u64,
        stripes: u32,
        exclude: Option<&str>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let eligible: Vec<(usize, u64)> = (0..self.slot_count())
            .map(|i| (i, self.slot(i)))
            .filter(|(_, m)| Some(m.device.as_str()) != exclude)
            .map(|(i, m)| (i, m.free_pe))
            .collect();
        let available: u64 = eligible.iter().map(|(_, free)| free).sum();

        let taken = if stripes <= 1 {
            plan_linear(&eligible, count, available)?
        } else {
            plan_striped(&eligible, count, stripes as usize, available, self.slot_count())?
        };

        let mut reserved = 0;
        for (slot, amount) in taken.into_iter().enumerate() {
            if amount == 0 {
                continue;
            }
            let member = self.slot_mut(slot);
            member.free_pe -= amount;
            *map.entry(member.device.clone()).or_insert(0) += amount;
            reserved += amount;
        }
        self.free_pe -= reserved;
        debug!(count, stripes, reserved, "Extents allocated");
        Ok(())
    }

    /// Give `count` extents of a volume back, walking its map in order.
    pub fn reclaim(&mut self, map: &mut PeMap, count: u64) -> Result<()> {
        let mapped: u64 = map.values().sum();
        if mapped < count {
            return Err(StorageError::pe_map(format!(
                "cannot free {} extents from a volume holding {}",
                count, mapped
            )));
        }
        if let Some(dev) = map.keys().find(|dev| self.member(dev).is_none()) {
            return Err(StorageError::pe_map(format!("{} is not a member of the pool", dev)));
        }

        let mut remaining = count;
        for (dev, used) in map.iter_mut() {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(*used);
            if let Some(member) = self.member_mut(dev) {
                member.free_pe += take;
            }
            *used -= take;
            remaining -= take;
        }
        map.retain(|_, used| *used > 0);
        self.free_pe += count;
        debug!(count, "Extents reclaimed");
        Ok(())
    }

    /// Release everything a volume holds on `device`; returns the count.
    pub fn release_on_member(&mut self, map: &mut PeMap, device: &str) -> Result<u64> {
        let Some(count) = map.get(device).copied() else {
            return Ok(0);
        };
        let member = self
            .member_mut(device)
            .ok_or_else(|| StorageError::pe_map(format!("{} is not a member of the pool", device)))?;
        member.free_pe += count;
        map.remove(device);
        self.free_pe += count;
        Ok(count)
    }
}

/// First-fit over the eligible members in slot order.
fn plan_linear(eligible: &[(usize, u64)], count: u64, available: u64) -> Result<Vec<u64>> {
    if available < count {
        return Err(StorageError::InsufficientSpace {
            requested: count,
            available,
        });
    }
    let slots = eligible.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
    let mut taken = vec![0; slots];
    let mut remaining = count;
    for &(slot, free) in eligible {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(free);
        taken[slot] = take;
        remaining -= take;
    }
    Ok(taken)
}

/// Round-based striped check: each round takes the same amount from the
/// `stripes` emptiest members that still have room.
fn plan_striped(
    eligible: &[(usize, u64)],
    count: u64,
    stripes: usize,
    available: u64,
    slots: usize,
) -> Result<Vec<u64>> {
    let mut per_stripe = count.div_ceil(stripes as u64);
    let mut candidates: Vec<(usize, u64)> =
        eligible.iter().copied().filter(|(_, free)| *free > 0).collect();
    candidates.sort_by_key(|(_, free)| *free);

    let mut taken = vec![0; slots];
    while per_stripe > 0 && candidates.len() >= stripes {
        let round = per_stripe.min(candidates[0].1);
        for (slot, free) in candidates.iter_mut().take(stripes) {
            *free -= round;
            taken[*slot] += round;
        }
        per_stripe -= round;
        candidates.retain(|(_, free)| *free > 0);
        candidates.sort_by_key(|(_, free)| *free);
    }

    if per_stripe > 0 {
        return Err(StorageError::InsufficientSpace {
            requested: count,
            available,
        });
    }
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(members: &[(&str, u64)]) -> ExtentPool {
        ExtentPool::with_members(
            4096,
            members.iter().map(|(d, n)| PvInfo::new(*d, *n)).collect(),
        )
    }

    #[test]
    fn test_linear_first_fit() {
        let mut pool = pool(&[("/dev/sdb1", 10), ("/dev/sdc1", 5)]);
        let mut map = PeMap::new();
        pool.allocate(&mut map, 12, 1).expect("fits"); // test: known-good input
        assert_eq!(map.get("/dev/sdb1"), Some(&10));
        assert_eq!(map.get("/dev/sdc1"), Some(&2));
        assert_eq!(pool.free_pe, 3);
    }

    #[test]
    fn test_linear_walks_staged_members_last() {
        let mut pool = pool(&[("/dev/sdz1", 2)]);
        pool.add_member(PvInfo::new("/dev/sda1", 8)).expect("add"); // test: known-good input
        let mut map = PeMap::new();
        pool.allocate(&mut map, 4, 1).expect("fits"); // test: known-good input
        assert_eq!(map.get("/dev/sdz1"), Some(&2));
        assert_eq!(map.get("/dev/sda1"), Some(&2));
    }

    #[test]
    fn test_striped_takes_equal_shares() {
        let mut pool = pool(&[("/dev/sdb1", 10), ("/dev/sdc1", 10), ("/dev/sdd1", 1)]);
        let mut map = PeMap::new();
        pool.allocate(&mut map, 6, 2).expect("fits"); // test: known-good input
        // round one: 1 each from sdd1 and sdb1; round two: 2 each from sdb1 and sdc1
        assert_eq!(map.get("/dev/sdb1"), Some(&3));
        assert_eq!(map.get("/dev/sdc1"), Some(&2));
        assert_eq!(map.values().sum::<u64>(), 6);
        assert_eq!(pool.free_pe, 21 - 6);
        assert_eq!(map.get("/dev/sdd1"), Some(&1));
    }

    #[test]
    fn test_reclaim_walks_map_in_name_order() {
        let mut pool = pool(&[("/dev/sdb1", 10), ("/dev/sdc1", 10)]);
        let mut map = PeMap::new();
        pool.allocate(&mut map, 15, 1).expect("fits"); // test: known-good input
        pool.reclaim(&mut map, 12).expect("reclaim"); // test: known-good input
        assert_eq!(map.get("/dev/sdb1"), None);
        assert_eq!(map.get("/dev/sdc1"), Some(&3));
        assert_eq!(pool.free_pe, 17);
    }

    #[test]
    fn test_reclaim_unknown_member_changes_nothing() {
        let mut pool = pool(&[("/dev/sdb1", 10)]);
        let mut map = PeMap::from([("/dev/ghost".to_string(), 4)]);
        let before = pool.clone();
        let err = pool.reclaim(&mut map, 2).unwrap_err();
        assert!(matches!(err, StorageError::PeMapInconsistent(_)));
        assert_eq!(pool, before);
        assert_eq!(map.get("/dev/ghost"), Some(&4));
    }

    #[test]
    fn test_add_member_twice_is_rejected() {
        let mut pool = pool(&[("/dev/sdb1", 10)]);
        let err = pool.add_member(PvInfo::new("/dev/sdb1", 10)).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyInUse { .. }));
    }

    #[test]
    fn test_extents_for_volume_rounds_to_stripes() {
        let pool = ExtentPool::new(4096);
        assert_eq!(pool.extents_for_size(4097), 2);
        assert_eq!(pool.extents_for_volume(4096 * 3, 2).ok(), Some(4));
        assert_eq!(pool.extents_for_volume(4096 * 3, 1).ok(), Some(3));
    }

    #[test]
    fn test_extents_for_volume_overflow_is_insufficient_space() {
        let pool = ExtentPool::new(1);
        let err = pool.extents_for_volume(u64::MAX, 2).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { requested: u64::MAX, .. }));
    }
}
