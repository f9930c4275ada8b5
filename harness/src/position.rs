// Copyright 2023 Oxide Computer Company
//! Test-side record of a raid group and which of its positions are out
//!
//! The engine knows which drives are missing; this is what the test
//! *meant* to do, so that it can put drives back in the right order and
//! check the engine's view against it.
use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;
use ringbuffer::{AllocRingBuffer, RingBuffer};
use sep::{DriveHandle, RaidGroupCreate};
use sep_common::{
    sep_bail, DriveLocation, ObjectId, Position, RaidType, SepError,
};

/// How many removals are remembered for LIFO reinsertion
pub const REMOVAL_HISTORY_DEPTH: usize = 8;
pub const DEFAULT_BLOCK_SIZE: u32 = 520;

/// How to choose the next position to pull
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalMode {
    /// Lowest position not already removed
    Sequential,
    /// Uniform over positions not already removed
    Random,
    /// First listed position not already removed
    Specific(Vec<Position>),
}

pub struct RaidGroupConfig {
    raid_group_id: u32,
    raid_type: RaidType,
    block_size: u32,
    /// Per-member capacity in blocks
    capacity: u64,
    rg_disk_set: Vec<DriveLocation>,

    /// One slot per position; `num_removed` counts the `Some`s
    removed: Vec<Option<Position>>,
    num_removed: usize,
    needing_spare: BTreeSet<Position>,
    /// Oldest first
    history: AllocRingBuffer<Position>,

    object_id: Option<ObjectId>,
    pulled: BTreeMap<Position, DriveHandle>,
}

impl RaidGroupConfig {
    pub fn new(
        raid_group_id: u32,
        raid_type: RaidType,
        rg_disk_set: Vec<DriveLocation>,
        capacity: u64,
    ) -> Result<Self, SepError> {
        let width = rg_disk_set.len();
        if !raid_type.valid_width(width) {
            sep_bail!(
                InvalidConfiguration,
                "{:?} cannot be {} wide",
                raid_type,
                width
            );
        }
        if capacity == 0 {
            sep_bail!(InvalidConfiguration, "raid group capacity is zero");
        }
        Ok(RaidGroupConfig {
            raid_group_id,
            raid_type,
            block_size: DEFAULT_BLOCK_SIZE,
            capacity,
            rg_disk_set,
            removed: vec![None; width],
            num_removed: 0,
            needing_spare: BTreeSet::new(),
            history: AllocRingBuffer::new(REMOVAL_HISTORY_DEPTH),
            object_id: None,
            pulled: BTreeMap::new(),
        })
    }

    pub fn raid_group_id(&self) -> u32 {
        self.raid_group_id
    }

    pub fn raid_type(&self) -> RaidType {
        self.raid_type
    }

    pub fn width(&self) -> usize {
        self.rg_disk_set.len()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn disk_set(&self) -> &[DriveLocation] {
        &self.rg_disk_set
    }

    pub fn drive_at(
        &self,
        position: Position,
    ) -> Result<DriveLocation, SepError> {
        self.check_position(position)?;
        Ok(self.rg_disk_set[position.get()])
    }

    /// The request that creates this raid group
    pub fn create_request(&self) -> RaidGroupCreate {
        RaidGroupCreate {
            raid_group_id: self.raid_group_id,
            raid_type: self.raid_type,
            drives: self.rg_disk_set.clone(),
            capacity: self.capacity,
        }
    }

    pub fn object_id(&self) -> Result<ObjectId, SepError> {
        self.object_id.ok_or(SepError::NotConfigured)
    }

    pub fn set_object_id(&mut self, object_id: Option<ObjectId>) {
        self.object_id = object_id;
    }

    fn check_position(&self, position: Position) -> Result<(), SepError> {
        if position.get() >= self.width() {
            sep_bail!(InvalidPosition, position);
        }
        Ok(())
    }

    pub fn num_removed(&self) -> usize {
        self.num_removed
    }

    pub fn is_removed(&self, position: Position) -> bool {
        self.removed.contains(&Some(position))
    }

    /// Removed positions, lowest first
    pub fn removed_positions(&self) -> Vec<Position> {
        let mut v: Vec<Position> =
            self.removed.iter().flatten().copied().collect();
        v.sort();
        v
    }

    pub fn add_removed_position(
        &mut self,
        position: Position,
    ) -> Result<(), SepError> {
        self.check_position(position)?;
        if self.is_removed(position) {
            sep_bail!(PositionAlreadyRemoved, position);
        }
        if self.num_removed == self.width() {
            sep_bail!(AllPositionsRemoved, self.width());
        }
        let Some(slot) = self.removed.iter_mut().find(|s| s.is_none()) else {
            sep_bail!(AllPositionsRemoved, self.width());
        };
        *slot = Some(position);
        self.num_removed += 1;
        self.history.push(position);
        Ok(())
    }

    pub fn get_next_position_to_remove<R: Rng>(
        &self,
        mode: &RemovalMode,
        rng: &mut R,
    ) -> Option<Position> {
        let mut candidates =
            Position::iter(self.width()).filter(|p| !self.is_removed(*p));
        match mode {
            RemovalMode::Sequential => candidates.next(),
            RemovalMode::Random => {
                let c: Vec<Position> = candidates.collect();
                c.choose(rng).copied()
            }
            RemovalMode::Specific(wanted) => wanted
                .iter()
                .copied()
                .find(|p| p.get() < self.width() && !self.is_removed(*p)),
        }
    }

    /// Most recently removed position that is still out
    ///
    /// Falls back to the lowest removed position once the history no
    /// longer reaches back far enough.
    pub fn get_next_position_to_insert(&self) -> Option<Position> {
        let recent: Vec<Position> = self.history.iter().copied().collect();
        recent
            .into_iter()
            .rev()
            .find(|p| self.is_removed(*p))
            .or_else(|| self.removed_positions().first().copied())
    }

    pub fn removed_position_inserted(
        &mut self,
        position: Position,
    ) -> Result<(), SepError> {
        let Some(slot) =
            self.removed.iter_mut().find(|s| **s == Some(position))
        else {
            sep_bail!(PositionNotRemoved, position);
        };
        *slot = None;
        self.num_removed -= 1;
        // Only positions still out stay in the history.
        let out: Vec<Position> =
            self.history.iter().copied().filter(|p| *p != position).collect();
        self.history.clear();
        for p in out {
            self.history.push(p);
        }
        Ok(())
    }

    pub fn needs_spare(&self, position: Position) -> bool {
        self.needing_spare.contains(&position)
    }

    pub fn add_needing_spare_position(
        &mut self,
        position: Position,
    ) -> Result<(), SepError> {
        self.check_position(position)?;
        if !self.needing_spare.insert(position) {
            sep_bail!(PositionAlreadyNeedsSpare, position);
        }
        Ok(())
    }

    pub fn delete_needing_spare_position(
        &mut self,
        position: Position,
    ) -> Result<(), SepError> {
        if !self.needing_spare.remove(&position) {
            sep_bail!(PositionNotNeedingSpare, position);
        }
        Ok(())
    }

    /// A spare now sits at `position`
    pub fn replace_drive(
        &mut self,
        position: Position,
        location: DriveLocation,
    ) -> Result<(), SepError> {
        self.check_position(position)?;
        self.rg_disk_set[position.get()] = location;
        self.pulled.remove(&position);
        Ok(())
    }

    pub(crate) fn stash_pulled(&mut self, position: Position, h: DriveHandle) {
        self.pulled.insert(position, h);
    }

    pub(crate) fn take_pulled(
        &mut self,
        position: Position,
    ) -> Option<DriveHandle> {
        self.pulled.remove(&position)
    }
}
