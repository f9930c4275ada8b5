// Copyright 2023 Oxide Computer Company
//! The system database shared by both SPs
//!
//! Holds the drive pool, the raid group and LUN topology, the object-id
//! allocator and the persisted SEP version stamp.  It is only touched by
//! job execution, spare swaps and simulated hardware changes; per-object
//! runtime state (checkpoints, flags) lives in each node's objects instead.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sep_common::{
    sep_bail, DriveLocation, JobNumber, ObjectId, RaidType, SepError, SpId,
};

use crate::drive::DrivePool;

/// First object id handed out; everything below is reserved
const FIRST_OBJECT_ID: u32 = 0x100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RaidGroupRecord {
    pub object_id: ObjectId,
    /// User-visible raid group number; `None` for the mirrors under a RAID10
    pub raid_group_id: Option<u32>,
    pub raid_type: RaidType,
    pub width: usize,
    /// Blocks used on each member
    pub capacity: u64,
    pub members: Vec<DriveLocation>,
    pub downstream: Vec<ObjectId>,
    pub parent: Option<ObjectId>,
    /// The SP whose job service created the object
    pub active_sp: SpId,
}

impl RaidGroupRecord {
    pub fn is_striper(&self) -> bool {
        self.raid_type == RaidType::Raid10 && self.parent.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LunRecord {
    pub raid_group: ObjectId,
    pub capacity: u64,
}

#[derive(Debug)]
pub(crate) struct SystemDb {
    pub drives: DrivePool,
    pub raid_groups: BTreeMap<ObjectId, RaidGroupRecord>,
    pub luns: BTreeMap<ObjectId, LunRecord>,
    next_object_id: u32,
    next_job: u64,
    persisted_sep_version: u64,
}

impl Default for SystemDb {
    fn default() -> Self {
        SystemDb {
            drives: DrivePool::default(),
            raid_groups: BTreeMap::new(),
            luns: BTreeMap::new(),
            next_object_id: FIRST_OBJECT_ID,
            next_job: 0,
            persisted_sep_version: 1,
        }
    }
}

/// Lock the shared database
///
/// A poisoned lock means a node task panicked; the database itself is
/// never left half-updated across a panic point, so carry on with it.
pub(crate) fn lock_db(db: &Mutex<SystemDb>) -> MutexGuard<'_, SystemDb> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SystemDb {
    pub fn alloc_object_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        id
    }

    pub fn alloc_job(&mut self) -> JobNumber {
        self.next_job += 1;
        JobNumber(self.next_job)
    }

    pub fn raid_group(
        &self,
        object: ObjectId,
    ) -> Result<&RaidGroupRecord, SepError> {
        match self.raid_groups.get(&object) {
            Some(r) => Ok(r),
            None => sep_bail!(ObjectNotFound, object),
        }
    }

    /// Find a top level raid group by its user-visible number
    pub fn lookup_raid_group(&self, raid_group_id: u32) -> Option<ObjectId> {
        self.raid_groups
            .values()
            .find(|r| r.raid_group_id == Some(raid_group_id))
            .map(|r| r.object_id)
    }

    pub fn downstream(
        &self,
        object: ObjectId,
    ) -> Result<Vec<ObjectId>, SepError> {
        Ok(self.raid_group(object)?.downstream.clone())
    }

    /// Objects that sit on top of `object`: a RAID10 striper above a
    /// mirror, LUNs above a raid group, nothing above a LUN
    pub fn upstream(
        &self,
        object: ObjectId,
    ) -> Result<Vec<ObjectId>, SepError> {
        if self.luns.contains_key(&object) {
            return Ok(vec![]);
        }
        let rg = self.raid_group(object)?;
        let mut out: Vec<ObjectId> = rg.parent.into_iter().collect();
        out.extend(
            self.luns
                .iter()
                .filter(|(_, l)| l.raid_group == object)
                .map(|(id, _)| *id),
        );
        Ok(out)
    }

    pub fn has_luns(&self, object: ObjectId) -> bool {
        self.luns.values().any(|l| l.raid_group == object)
    }

    pub fn persisted_sep_version(&self) -> u64 {
        self.persisted_sep_version
    }

    pub fn set_persisted_sep_version(&mut self, version: u64) {
        self.persisted_sep_version = version;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(id: u32, parent: Option<u32>) -> RaidGroupRecord {
        RaidGroupRecord {
            object_id: ObjectId(id),
            raid_group_id: parent.is_none().then_some(7),
            raid_type: RaidType::Raid10,
            width: 2,
            capacity: 0x1000,
            members: vec![],
            downstream: vec![],
            parent: parent.map(ObjectId),
            active_sp: SpId::A,
        }
    }

    #[test]
    fn object_ids_are_unique() {
        let mut db = SystemDb::default();
        let a = db.alloc_object_id();
        let b = db.alloc_object_id();
        assert_eq!(a, ObjectId(FIRST_OBJECT_ID));
        assert_ne!(a, b);
    }

    #[test]
    fn upstream_includes_parent_and_luns() {
        let mut db = SystemDb::default();
        let mut striper = record(0x100, None);
        striper.downstream = vec![ObjectId(0x101)];
        db.raid_groups.insert(ObjectId(0x100), striper);
        db.raid_groups.insert(ObjectId(0x101), record(0x101, Some(0x100)));
        db.luns.insert(
            ObjectId(0x102),
            LunRecord {
                raid_group: ObjectId(0x100),
                capacity: 0x100,
            },
        );

        assert_eq!(db.lookup_raid_group(7), Some(ObjectId(0x100)));
        assert_eq!(
            db.upstream(ObjectId(0x101)).unwrap(),
            vec![ObjectId(0x100)]
        );
        assert_eq!(
            db.upstream(ObjectId(0x100)).unwrap(),
            vec![ObjectId(0x102)]
        );
        assert_eq!(
            db.downstream(ObjectId(0x100)).unwrap(),
            vec![ObjectId(0x101)]
        );
        assert!(db.has_luns(ObjectId(0x100)));
        assert!(db.raid_groups[&ObjectId(0x100)].is_striper());
        assert!(!db.raid_groups[&ObjectId(0x101)].is_striper());
        assert_eq!(
            db.upstream(ObjectId(0x200)).unwrap_err(),
            SepError::ObjectNotFound(ObjectId(0x200))
        );
    }
}
