// Copyright 2023 Oxide Computer Company
//! Background operation scheduling
//!
//! Each monitor cycle, zeroing advances on its own and then exactly one
//! raid group operation (a rebuild or one verify type) advances by
//! `chunks_per_rebuild` chunks.  Checkpoints only ever move forward, and
//! drop to `None` when they reach the end of the member.
use std::ops::Range;
use std::time::Duration;

use sep_common::{
    sep_bail, DegradedBitmask, Lba, Position, RaidGroupInfo, SepError,
    VerifyType,
};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

pub const DEFAULT_CHUNK_SIZE: u64 = 0x800;
pub const MAX_CHUNKS_PER_REBUILD: u32 = 10;

/// What the scheduler picked for this cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BackgroundOp {
    /// All positions in the mask rebuild together
    Rebuild(DegradedBitmask),
    Verify(VerifyType),
}

/// Order in which pending verify types get to run
///
/// Must name every verify type exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<VerifyType>", into = "Vec<VerifyType>")]
pub struct VerifyPriority(Vec<VerifyType>);

impl Default for VerifyPriority {
    fn default() -> Self {
        VerifyPriority(vec![
            VerifyType::Error,
            VerifyType::IncompleteWrite,
            VerifyType::System,
            VerifyType::ReadWrite,
            VerifyType::ReadOnly,
        ])
    }
}

impl TryFrom<Vec<VerifyType>> for VerifyPriority {
    type Error = SepError;

    fn try_from(order: Vec<VerifyType>) -> Result<Self, SepError> {
        for vt in VerifyType::iter() {
            if order.iter().filter(|v| **v == vt).count() != 1 {
                sep_bail!(
                    InvalidArgument,
                    "verify priority must list {} exactly once",
                    vt
                );
            }
        }
        if order.len() != VerifyType::iter().count() {
            sep_bail!(InvalidArgument, "verify priority has extra entries");
        }
        Ok(VerifyPriority(order))
    }
}

impl From<VerifyPriority> for Vec<VerifyType> {
    fn from(p: VerifyPriority) -> Self {
        p.0
    }
}

impl VerifyPriority {
    pub fn iter(&self) -> impl Iterator<Item = VerifyType> + '_ {
        self.0.iter().copied()
    }
}

/// Scheduler knobs; all of them can be changed while the array runs
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    chunks_per_rebuild: u32,
    pub chunks_per_zero: u32,
    pub verify_priority: VerifyPriority,
    /// Swap in a hot spare once a position has been missing this long
    pub permanent_spare_trigger: Option<Duration>,
    /// Drive glitches no longer than this are not treated as removals
    pub glitch_debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            chunks_per_rebuild: 1,
            chunks_per_zero: 1,
            verify_priority: VerifyPriority::default(),
            permanent_spare_trigger: None,
            glitch_debounce: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn chunks_per_rebuild(&self) -> u32 {
        self.chunks_per_rebuild
    }

    pub fn set_chunks_per_rebuild(
        &mut self,
        chunks: u32,
    ) -> Result<(), SepError> {
        if !(1..=MAX_CHUNKS_PER_REBUILD).contains(&chunks) {
            sep_bail!(
                InvalidArgument,
                "chunks per rebuild {} outside 1..={}",
                chunks,
                MAX_CHUNKS_PER_REBUILD
            );
        }
        self.chunks_per_rebuild = chunks;
        Ok(())
    }
}

/// Blocks covered by the next step from `checkpoint`
pub(crate) fn chunk_range(
    checkpoint: Lba,
    chunks: u32,
    chunk_size: u64,
    capacity: u64,
) -> Range<u64> {
    let end = checkpoint
        .0
        .saturating_add(chunks as u64 * chunk_size)
        .min(capacity);
    checkpoint.0..end
}

/// Checkpoint after one step, `None` once the end is reached
pub(crate) fn advance(
    checkpoint: Lba,
    chunks: u32,
    chunk_size: u64,
    capacity: u64,
) -> Option<Lba> {
    let r = chunk_range(checkpoint, chunks, chunk_size, capacity);
    (r.end < capacity).then_some(Lba(r.end))
}

/// Pick this cycle's raid group operation
///
/// Rebuild of every position whose drive is present wins over verify.
/// System verify waits until zeroing has finished.
pub(crate) fn select_op(
    info: &RaidGroupInfo,
    priority: &VerifyPriority,
) -> Option<BackgroundOp> {
    let mut rebuild = DegradedBitmask::empty();
    for p in Position::iter(info.width) {
        let i = p.get();
        if info.rebuild_checkpoint[i].is_some() && !info.rb_logging[i] {
            rebuild.set(p);
        }
    }
    if !rebuild.is_empty() {
        return Some(BackgroundOp::Rebuild(rebuild));
    }
    priority
        .iter()
        .filter(|vt| {
            *vt != VerifyType::System || info.zeroing_is_finished()
        })
        .find(|vt| info.verify_checkpoint(*vt).is_some())
        .map(BackgroundOp::Verify)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use sep_common::{
        ClusteredFlags, LifecycleState, MetadataElementState, ObjectId,
        RaidType, VerifyReport,
    };
    use test_strategy::proptest;

    fn info(width: usize) -> RaidGroupInfo {
        RaidGroupInfo {
            object_id: ObjectId(0x100),
            raid_type: RaidType::Raid5,
            width,
            capacity: 0x10000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            lifecycle_state: LifecycleState::Ready,
            metadata_element_state: MetadataElementState::Active,
            rb_logging: vec![false; width],
            rebuild_checkpoint: vec![None; width],
            rw_verify_checkpoint: None,
            ro_verify_checkpoint: None,
            error_verify_checkpoint: None,
            system_verify_checkpoint: None,
            incomplete_write_verify_checkpoint: None,
            zero_checkpoint: None,
            base_config_clustered_flags: ClusteredFlags::empty(),
            is_event_q_empty: true,
            verify_report: VerifyReport::default(),
        }
    }

    #[test]
    fn rebuild_beats_verify() {
        let mut i = info(5);
        i.error_verify_checkpoint = Some(Lba(0));
        i.rebuild_checkpoint[1] = Some(Lba(0x800));
        i.rebuild_checkpoint[3] = Some(Lba(0));
        let p = VerifyPriority::default();
        assert_eq!(
            select_op(&i, &p),
            Some(BackgroundOp::Rebuild(DegradedBitmask(0b01010)))
        );

        // A rebuilding position whose drive is gone again waits.
        i.rb_logging[1] = true;
        i.rb_logging[3] = true;
        assert_eq!(
            select_op(&i, &p),
            Some(BackgroundOp::Verify(VerifyType::Error))
        );
    }

    #[test]
    fn system_verify_waits_for_zeroing() {
        let mut i = info(3);
        i.system_verify_checkpoint = Some(Lba(0));
        i.rw_verify_checkpoint = Some(Lba(0));
        i.zero_checkpoint = Some(Lba(0x4000));
        let p = VerifyPriority::default();
        assert_eq!(
            select_op(&i, &p),
            Some(BackgroundOp::Verify(VerifyType::ReadWrite))
        );
        i.zero_checkpoint = None;
        assert_eq!(
            select_op(&i, &p),
            Some(BackgroundOp::Verify(VerifyType::System))
        );
    }

    #[test]
    fn custom_priority() {
        let mut i = info(3);
        i.ro_verify_checkpoint = Some(Lba(0));
        i.error_verify_checkpoint = Some(Lba(0));
        let p = VerifyPriority::try_from(vec![
            VerifyType::ReadOnly,
            VerifyType::ReadWrite,
            VerifyType::Error,
            VerifyType::System,
            VerifyType::IncompleteWrite,
        ])
        .unwrap();
        assert_eq!(
            select_op(&i, &p),
            Some(BackgroundOp::Verify(VerifyType::ReadOnly))
        );
        assert_eq!(select_op(&info(3), &p), None);
    }

    #[test]
    fn bad_priorities() {
        assert!(VerifyPriority::try_from(vec![VerifyType::Error]).is_err());
        let mut dup: Vec<_> = VerifyType::iter().collect();
        dup.push(VerifyType::Error);
        assert!(VerifyPriority::try_from(dup).is_err());
    }

    #[test]
    fn chunks_per_rebuild_bounds() {
        let mut c = SchedulerConfig::default();
        assert_eq!(c.chunks_per_rebuild(), 1);
        assert!(c.set_chunks_per_rebuild(0).is_err());
        assert!(c.set_chunks_per_rebuild(11).is_err());
        c.set_chunks_per_rebuild(10).unwrap();
        assert_eq!(c.chunks_per_rebuild(), 10);
    }

    #[test]
    fn last_chunk_is_clipped() {
        assert_eq!(
            chunk_range(Lba(0xf800), 4, 0x800, 0x10000),
            0xf800..0x10000
        );
        assert_eq!(advance(Lba(0xf800), 4, 0x800, 0x10000), None);
        assert_eq!(advance(Lba(0), 1, 0x800, 0x10000), Some(Lba(0x800)));
    }

    /// Checkpoints climb strictly and end in `None`; the number of steps
    /// depends on the chunk count but the end state does not.
    #[proptest]
    fn checkpoints_are_monotonic(
        #[strategy(1..=MAX_CHUNKS_PER_REBUILD)] chunks: u32,
        #[strategy(1u64..64)] capacity_chunks: u64,
    ) {
        let capacity = capacity_chunks * DEFAULT_CHUNK_SIZE;
        let mut cp = Some(Lba(0));
        let mut steps = 0u64;
        while let Some(c) = cp {
            let next = advance(c, chunks, DEFAULT_CHUNK_SIZE, capacity);
            if let Some(n) = next {
                prop_assert!(n > c);
                prop_assert!(n.0 < capacity);
            }
            cp = next;
            steps += 1;
        }
        prop_assert_eq!(steps, capacity_chunks.div_ceil(chunks as u64));
    }
}
