// Copyright 2023 Oxide Computer Company
//! Runtime state of one raid group object on one SP
//!
//! On its Active SP the object tracks member presence, owns the rebuild,
//! verify and zeroing checkpoints, and advances them once per monitor
//! cycle.  On the Passive SP the same type just holds whatever the Active
//! side last pushed.
use std::collections::{BTreeSet, VecDeque};

use sep_common::{
    sep_bail, ClusteredFlags, DegradedBitmask, DriveLocation, LifecycleState,
    Lba, MetadataElementState, ObjectId, Position, RaidGroupInfo, RaidType,
    SepError, VerifyReport, VerifyType,
};
use slog::{debug, info, o, warn, Logger};
use tokio::time::Instant;

use crate::background::{
    advance, chunk_range, select_op, BackgroundOp, SchedulerConfig,
};
use crate::db::{RaidGroupRecord, SystemDb};
use crate::job::swap_in_spare;
use crate::quiesce::QuiesceState;

/// What changed during one monitor cycle
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct MonitorOutcome {
    /// Clustered flags differ from before the cycle
    pub flags_changed: bool,
    /// The database was changed (a spare was swapped in)
    pub config_changed: bool,
}

#[derive(Debug)]
pub(crate) struct RaidGroup {
    pub id: ObjectId,
    pub members: Vec<DriveLocation>,
    pub downstream: Vec<ObjectId>,
    pub parent: Option<ObjectId>,

    /// Checkpoints, lifecycle and flags, in the shape queries return them
    state: RaidGroupInfo,
    quiesce: QuiesceState,

    /// Verify requests accepted but not yet turned into checkpoints
    events: VecDeque<VerifyType>,
    media_errors: BTreeSet<(Position, Lba)>,
    /// Serial of the drive last seen at each position
    member_serials: Vec<Option<u64>>,
    removed_since: Vec<Option<Instant>>,

    log: Logger,
}

impl RaidGroup {
    pub fn new(
        record: &RaidGroupRecord,
        element_state: MetadataElementState,
        chunk_size: u64,
        log: &Logger,
    ) -> Self {
        let width = record.width;
        let striper = record.is_striper();
        let mut events = VecDeque::new();
        if !striper {
            events.push_back(VerifyType::System);
        }
        let mut rg = RaidGroup {
            id: record.object_id,
            members: record.members.clone(),
            downstream: record.downstream.clone(),
            parent: record.parent,
            state: RaidGroupInfo {
                object_id: record.object_id,
                raid_type: record.raid_type,
                width,
                capacity: record.capacity,
                chunk_size,
                lifecycle_state: LifecycleState::Specialize,
                metadata_element_state: element_state,
                rb_logging: vec![false; width],
                rebuild_checkpoint: vec![None; width],
                rw_verify_checkpoint: None,
                ro_verify_checkpoint: None,
                error_verify_checkpoint: None,
                system_verify_checkpoint: None,
                incomplete_write_verify_checkpoint: None,
                zero_checkpoint: (!striper).then_some(Lba(0)),
                base_config_clustered_flags: ClusteredFlags::empty(),
                is_event_q_empty: true,
                verify_report: VerifyReport::default(),
            },
            quiesce: QuiesceState::default(),
            events,
            media_errors: BTreeSet::new(),
            member_serials: vec![None; width],
            removed_since: vec![None; width],
            log: log.new(o!(
                "object" => record.object_id.to_string(),
                "raid_group" => format!("{:?}", record.raid_group_id)
            )),
        };
        rg.refresh();
        rg
    }

    pub fn is_active(&self) -> bool {
        self.state.metadata_element_state == MetadataElementState::Active
    }

    pub fn is_striper(&self) -> bool {
        self.state.raid_type == RaidType::Raid10 && self.parent.is_none()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state.lifecycle_state
    }

    pub fn flags(&self) -> ClusteredFlags {
        self.state.base_config_clustered_flags
    }

    pub fn info(&self) -> RaidGroupInfo {
        self.state.clone()
    }

    /// Recompute derived fields; returns true if the clustered flags moved
    fn refresh(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut flags = self.quiesce.flags();
        if self.state.is_degraded() {
            flags |= ClusteredFlags::DEGRADED;
        }
        if self.state.rebuild_checkpoint.iter().any(|c| c.is_some()) {
            flags |= ClusteredFlags::REBUILDING;
        }
        self.state.is_event_q_empty = self.events.is_empty();
        let changed = flags != self.state.base_config_clustered_flags;
        self.state.base_config_clustered_flags = flags;
        changed
    }

    pub fn request_quiesce(&mut self) -> bool {
        self.quiesce = self.quiesce.request_quiesce();
        self.refresh()
    }

    pub fn request_unquiesce(&mut self) -> bool {
        self.quiesce = self.quiesce.request_unquiesce();
        self.refresh()
    }

    pub fn queue_verify(&mut self, vt: VerifyType) {
        self.events.push_back(vt);
        self.refresh();
    }

    pub fn inject_media_error(
        &mut self,
        position: Position,
        lba: Lba,
    ) -> Result<(), SepError> {
        if position.get() >= self.state.width {
            sep_bail!(InvalidPosition, position);
        }
        if lba.0 >= self.state.capacity {
            sep_bail!(
                InvalidArgument,
                "{} is past the end of {}",
                lba,
                self.id
            );
        }
        debug!(self.log, "media error injected";
            "position" => %position, "lba" => %lba);
        self.media_errors.insert((position, lba));
        Ok(())
    }

    /// Overwrite our copy with the Active side's snapshot
    pub fn apply_snapshot(&mut self, snapshot: &RaidGroupInfo) {
        if self.is_active() {
            warn!(self.log, "ignoring peer snapshot for an active object");
            return;
        }
        self.state = snapshot.clone();
        self.state.metadata_element_state = MetadataElementState::Passive;
    }

    pub fn set_peer_flags(&mut self, flags: ClusteredFlags) {
        if !self.is_active() {
            self.state.base_config_clustered_flags = flags;
        }
    }

    /// Bring members in line with the database after a config change
    pub fn sync_members(&mut self, members: &[DriveLocation]) {
        for (i, loc) in members.iter().enumerate() {
            if self.members.get(i).is_some_and(|m| m != loc) {
                self.replace_member(Position::new(i), *loc);
            }
        }
    }

    fn replace_member(&mut self, position: Position, location: DriveLocation) {
        let i = position.get();
        info!(self.log, "new drive at position {}", position;
            "drive" => %location);
        self.members[i] = location;
        self.member_serials[i] = None;
        self.removed_since[i] = None;
        if self.is_active() && !self.is_striper() {
            self.state.rb_logging[i] = false;
            if self.state.raid_type.is_redundant() {
                self.state.rebuild_checkpoint[i] = Some(Lba(0));
            }
            self.media_errors.retain(|(p, _)| *p != position);
        }
        self.refresh();
    }

    /// Striper lifecycle follows its mirrors
    pub fn set_striper_lifecycle(&mut self, any_mirror_failed: bool) -> bool {
        let next = if any_mirror_failed {
            LifecycleState::Fail
        } else {
            LifecycleState::Ready
        };
        if next != self.state.lifecycle_state {
            info!(
                self.log,
                "lifecycle {:?} -> {:?}", self.state.lifecycle_state, next
            );
            self.state.lifecycle_state = next;
        }
        self.quiesce = self.quiesce.on_cycle();
        self.refresh()
    }

    /// One monitor cycle on the Active SP
    pub fn monitor(
        &mut self,
        db: &mut SystemDb,
        now: Instant,
        cfg: &SchedulerConfig,
    ) -> MonitorOutcome {
        let mut out = MonitorOutcome::default();
        self.check_members(db, now, cfg);
        out.config_changed = self.check_permanent_spare(db, now, cfg);
        self.update_lifecycle();

        self.quiesce = self.quiesce.on_cycle();
        if self.state.lifecycle_state == LifecycleState::Ready
            && self.quiesce.allows_background()
        {
            self.drain_events();
            if let Some(z) = self.state.zero_checkpoint {
                self.state.zero_checkpoint = advance(
                    z,
                    cfg.chunks_per_zero,
                    self.state.chunk_size,
                    self.state.capacity,
                );
                if self.state.zero_checkpoint.is_none() {
                    info!(self.log, "zeroing complete");
                }
            }
            match select_op(&self.state, &cfg.verify_priority) {
                Some(BackgroundOp::Rebuild(mask)) => {
                    for p in mask.positions() {
                        self.rebuild_chunk(p, mask, cfg.chunks_per_rebuild());
                    }
                }
                Some(BackgroundOp::Verify(vt)) => {
                    self.verify_chunk(vt, cfg.chunks_per_rebuild())
                }
                None => (),
            }
        }
        out.flags_changed = self.refresh();
        out
    }

    fn check_members(
        &mut self,
        db: &SystemDb,
        now: Instant,
        cfg: &SchedulerConfig,
    ) {
        let redundant = self.state.raid_type.is_redundant();
        for p in Position::iter(self.state.width) {
            let i = p.get();
            let present =
                db.drives
                    .present_serial(self.members[i], now, cfg.glitch_debounce);
            let Some(serial) = present else {
                if !self.state.rb_logging[i] {
                    warn!(self.log, "position {} removed", p;
                        "drive" => %self.members[i]);
                    self.state.rb_logging[i] = true;
                    self.removed_since[i] = Some(now);
                }
                continue;
            };
            let new_drive = self.member_serials[i].is_some_and(|s| s != serial);
            if self.state.rb_logging[i] {
                self.state.rb_logging[i] = false;
                self.removed_since[i] = None;
                if redundant {
                    let resume = if new_drive {
                        Lba(0)
                    } else {
                        self.state.rebuild_checkpoint[i].unwrap_or(Lba(0))
                    };
                    info!(
                        self.log,
                        "position {} back, rebuild from {}", p, resume
                    );
                    self.state.rebuild_checkpoint[i] = Some(resume);
                }
            } else if new_drive && redundant {
                info!(self.log, "position {} replaced, rebuild from 0", p);
                self.state.rebuild_checkpoint[i] = Some(Lba(0));
            }
            if new_drive {
                self.media_errors.retain(|(q, _)| *q != p);
            }
            self.member_serials[i] = Some(serial);
        }
    }

    fn check_permanent_spare(
        &mut self,
        db: &mut SystemDb,
        now: Instant,
        cfg: &SchedulerConfig,
    ) -> bool {
        let Some(trigger) = cfg.permanent_spare_trigger else {
            return false;
        };
        if !self.state.raid_type.is_redundant() {
            return false;
        }
        let mut swapped = false;
        for p in Position::iter(self.state.width) {
            let Some(since) = self.removed_since[p.get()] else {
                continue;
            };
            if now.duration_since(since) < trigger {
                continue;
            }
            let Some(spare) = db.drives.spares(self.state.capacity).next()
            else {
                debug!(self.log, "no spare for position {}", p);
                continue;
            };
            match swap_in_spare(db, self.id, p, spare) {
                Ok(()) => {
                    self.replace_member(p, spare);
                    swapped = true;
                }
                Err(code) => {
                    warn!(self.log, "spare swap at {} refused: {:?}", p, code)
                }
            }
        }
        swapped
    }

    fn update_lifecycle(&mut self) {
        let missing = self.state.rb_logging.iter().filter(|b| **b).count();
        let tolerated =
            self.state.raid_type.tolerated_failures(self.state.width);
        let next = if missing > tolerated {
            LifecycleState::Fail
        } else {
            LifecycleState::Ready
        };
        if next != self.state.lifecycle_state {
            info!(
                self.log,
                "lifecycle {:?} -> {:?}", self.state.lifecycle_state, next;
                "missing" => missing
            );
            self.state.lifecycle_state = next;
        }
    }

    fn verify_checkpoint_mut(&mut self, vt: VerifyType) -> &mut Option<Lba> {
        match vt {
            VerifyType::ReadWrite => &mut self.state.rw_verify_checkpoint,
            VerifyType::ReadOnly => &mut self.state.ro_verify_checkpoint,
            VerifyType::Error => &mut self.state.error_verify_checkpoint,
            VerifyType::System => &mut self.state.system_verify_checkpoint,
            VerifyType::IncompleteWrite => {
                &mut self.state.incomplete_write_verify_checkpoint
            }
        }
    }

    /// Turn queued verify requests into checkpoints
    ///
    /// A request for a type that is already running is folded into it.
    /// When the running pass is past the requested start, the request
    /// stays queued and starts a fresh pass once the current one ends.
    fn drain_events(&mut self) {
        let mut deferred = VecDeque::new();
        while let Some(vt) = self.events.pop_front() {
            let cp = self.verify_checkpoint_mut(vt);
            if cp.is_none() {
                *cp = Some(Lba(0));
            } else if *cp != Some(Lba(0)) {
                deferred.push_back(vt);
            }
        }
        self.events = deferred;
    }

    fn rebuild_chunk(
        &mut self,
        p: Position,
        rebuilding: DegradedBitmask,
        chunks: u32,
    ) {
        let i = p.get();
        let Some(cp) = self.state.rebuild_checkpoint[i] else {
            return;
        };
        let range =
            chunk_range(cp, chunks, self.state.chunk_size, self.state.capacity);

        // The rebuilt range is rewritten, errors on it are gone; errors on
        // the surviving members leave holes we cannot reconstruct.
        self.media_errors
            .retain(|(q, lba)| !(*q == p && range.contains(&lba.0)));
        let bad: Vec<Lba> = self
            .media_errors
            .iter()
            .filter(|(q, lba)| {
                !rebuilding.contains(*q) && range.contains(&lba.0)
            })
            .map(|(_, lba)| *lba)
            .collect();
        if let Some(first) = bad.iter().min() {
            warn!(
                self.log,
                "rebuild of {} hit {} unreadable blocks", p, bad.len()
            );
            self.state.verify_report.uncorrectable_errors += bad.len() as u64;
            let chunk_size = self.state.chunk_size;
            self.mark_for_error_verify(Lba(first.0 - first.0 % chunk_size));
        }

        self.state.rebuild_checkpoint[i] =
            advance(cp, chunks, self.state.chunk_size, self.state.capacity);
        if self.state.rebuild_checkpoint[i].is_none() {
            info!(self.log, "rebuild of position {} complete", p);
        }
    }

    fn verify_chunk(&mut self, vt: VerifyType, chunks: u32) {
        let Some(cp) = self.state.verify_checkpoint(vt) else {
            return;
        };
        let chunk_size = self.state.chunk_size;
        let range = chunk_range(cp, chunks, chunk_size, self.state.capacity);
        let hits: Vec<(Position, Lba)> = self
            .media_errors
            .iter()
            .filter(|(_, lba)| range.contains(&lba.0))
            .copied()
            .collect();

        if !hits.is_empty() {
            if vt == VerifyType::Error {
                for h in &hits {
                    self.media_errors.remove(h);
                }
                self.state.verify_report.errors_corrected += hits.len() as u64;
            } else {
                self.state.verify_report.errors_found += hits.len() as u64;
                let first =
                    hits.iter().map(|(_, lba)| lba.0).min().unwrap_or(0);
                self.mark_for_error_verify(Lba(first - first % chunk_size));
            }
            debug!(
                self.log,
                "{} verify at {} hit {} errors", vt, cp, hits.len()
            );
        }

        let next = advance(cp, chunks, chunk_size, self.state.capacity);
        *self.verify_checkpoint_mut(vt) = next;
        if next.is_none() {
            self.state.verify_report.passes_completed += 1;
            info!(self.log, "{} verify pass complete", vt);
        }
    }

    /// Arrange for an error verify to cover `chunk_start`
    fn mark_for_error_verify(&mut self, chunk_start: Lba) {
        match self.state.error_verify_checkpoint {
            None => self.state.error_verify_checkpoint = Some(chunk_start),
            Some(c) if c <= chunk_start => (),
            // Already past it; the checkpoint never moves backwards, so
            // run another pass afterwards.
            Some(_) => self.events.push_back(VerifyType::Error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::background::DEFAULT_CHUNK_SIZE;
    use crate::drive::DriveHandle;
    use crate::job::{execute, JobRequest, RaidGroupCreate};
    use sep_common::{build_logger, SpId};
    use std::time::Duration;

    const CAPACITY: u64 = 0x10000;
    const CYCLE: Duration = Duration::from_millis(100);

    struct Rig {
        db: SystemDb,
        rg: RaidGroup,
        cfg: SchedulerConfig,
        now: Instant,
        drives: Vec<DriveLocation>,
    }

    impl Rig {
        fn new(raid_type: RaidType, width: usize) -> Rig {
            let mut db = SystemDb::default();
            let drives: Vec<_> = (0..width as u32 + 2)
                .map(|s| DriveLocation::new(0, 1, s))
                .collect();
            for d in &drives {
                db.drives.insert_new(*d, 2 * CAPACITY).unwrap();
            }
            let req = JobRequest::CreateRaidGroup(RaidGroupCreate {
                raid_group_id: 1,
                raid_type,
                drives: drives[..width].to_vec(),
                capacity: CAPACITY,
            });
            let id = execute(&mut db, SpId::A, &req).unwrap().unwrap();
            let rg = RaidGroup::new(
                &db.raid_groups[&id],
                MetadataElementState::Active,
                DEFAULT_CHUNK_SIZE,
                &build_logger(),
            );
            Rig {
                db,
                rg,
                cfg: SchedulerConfig::default(),
                now: Instant::now(),
                drives,
            }
        }

        fn cycle(&mut self) -> MonitorOutcome {
            self.now += CYCLE;
            self.rg.monitor(&mut self.db, self.now, &self.cfg)
        }

        /// Cycle until `done`, panicking if it takes unreasonably long
        fn cycle_until(&mut self, done: impl Fn(&RaidGroupInfo) -> bool) {
            for _ in 0..10_000 {
                if done(&self.rg.info()) {
                    return;
                }
                self.cycle();
            }
            panic!("never finished: {:?}", self.rg.info());
        }

        fn settle(&mut self) {
            self.cycle_until(|i| {
                i.verify_is_finished()
                    && i.zeroing_is_finished()
                    && i.rebuild_is_finished()
            });
        }

        fn pull(&mut self, pos: usize) -> DriveHandle {
            self.db.drives.pull(self.drives[pos]).unwrap()
        }

        fn reinsert(&mut self, pos: usize, h: DriveHandle) {
            self.db.drives.reinsert(self.drives[pos], h).unwrap();
        }
    }

    #[test]
    fn fresh_group_zeroes_then_system_verifies() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        let info = r.rg.info();
        assert_eq!(info.lifecycle_state, LifecycleState::Specialize);
        assert!(!info.is_event_q_empty);
        assert_eq!(info.zero_checkpoint, Some(Lba(0)));

        r.cycle();
        let info = r.rg.info();
        assert_eq!(info.lifecycle_state, LifecycleState::Ready);
        assert!(info.is_event_q_empty);
        // System verify is pending, but zeroing is still going.
        assert_eq!(info.system_verify_checkpoint, Some(Lba(0)));
        assert_eq!(info.zero_checkpoint, Some(Lba(DEFAULT_CHUNK_SIZE)));

        r.cycle_until(|i| i.zeroing_is_finished());
        assert!(r.rg.info().system_verify_checkpoint.is_some());
        r.settle();
        assert_eq!(r.rg.info().verify_report.passes_completed, 1);
    }

    #[test]
    fn remove_and_rebuild_position_two() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();

        let h = r.pull(2);
        let out = r.cycle();
        assert!(out.flags_changed);
        let info = r.rg.info();
        assert_eq!(info.degraded_bitmask(), DegradedBitmask(0b00100));
        assert_eq!(info.lifecycle_state, LifecycleState::Ready);
        assert!(r.rg.flags().contains(ClusteredFlags::DEGRADED));

        r.reinsert(2, h);
        r.cycle();
        let info = r.rg.info();
        assert!(!info.rb_logging[2]);
        assert!(info.rebuild_checkpoint[2].is_some());
        assert_eq!(info.degraded_bitmask(), DegradedBitmask(0b00100));
        assert!(r.rg.flags().contains(ClusteredFlags::REBUILDING));

        r.cycle_until(|i| i.rebuild_is_finished());
        assert_eq!(r.rg.info().degraded_bitmask(), DegradedBitmask::empty());
        assert!(r.rg.flags().is_empty());
    }

    #[test]
    fn rebuild_resumes_from_retained_checkpoint() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        let h = r.pull(0);
        r.cycle();
        r.reinsert(0, h);
        for _ in 0..4 {
            r.cycle();
        }
        let cp = r.rg.info().rebuild_checkpoint[0].unwrap();
        assert!(cp > Lba(0));

        let h = r.pull(0);
        r.cycle();
        r.cycle();
        assert_eq!(r.rg.info().rebuild_checkpoint[0], Some(cp));
        r.reinsert(0, h);
        r.cycle();
        // Picked up where it left off and advanced one more chunk.
        assert_eq!(
            r.rg.info().rebuild_checkpoint[0],
            Some(Lba(cp.0 + DEFAULT_CHUNK_SIZE))
        );
    }

    #[test]
    fn new_drive_rebuilds_from_zero() {
        let mut r = Rig::new(RaidType::Raid1, 2);
        r.settle();
        let h = r.pull(1);
        r.cycle();
        r.reinsert(1, h);
        for _ in 0..4 {
            r.cycle();
        }
        let _h = r.pull(1);
        r.cycle();
        r.db.drives.insert_new(r.drives[1], 2 * CAPACITY).unwrap();
        r.cycle();
        assert_eq!(
            r.rg.info().rebuild_checkpoint[1],
            Some(Lba(DEFAULT_CHUNK_SIZE))
        );
    }

    #[test]
    fn too_many_removed_fails_until_reinsert() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        r.rg.queue_verify(VerifyType::ReadOnly);
        let h0 = r.pull(0);
        let _h1 = r.pull(1);
        r.cycle();
        let info = r.rg.info();
        assert_eq!(info.lifecycle_state, LifecycleState::Fail);
        // No background work while failed; the request stays queued.
        assert!(!info.is_event_q_empty);
        r.cycle();
        assert_eq!(r.rg.info().ro_verify_checkpoint, None);

        r.reinsert(0, h0);
        r.cycle();
        let info = r.rg.info();
        assert_eq!(info.lifecycle_state, LifecycleState::Ready);
        assert!(info.rb_logging[1]);
    }

    #[test]
    fn raid0_has_no_rebuild() {
        let mut r = Rig::new(RaidType::Raid0, 3);
        r.settle();
        let h = r.pull(1);
        r.cycle();
        assert_eq!(r.rg.lifecycle(), LifecycleState::Fail);
        r.reinsert(1, h);
        r.cycle();
        let info = r.rg.info();
        assert_eq!(info.lifecycle_state, LifecycleState::Ready);
        assert!(!info.is_degraded());
    }

    #[test]
    fn quiesce_holds_checkpoints() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        r.rg.queue_verify(VerifyType::ReadWrite);
        r.cycle();
        let before = r.rg.info().rw_verify_checkpoint;
        assert!(before.is_some());

        assert!(r.rg.request_quiesce());
        assert!(r.rg.flags().contains(ClusteredFlags::QUIESCING));
        r.cycle();
        assert!(r.rg.flags().contains(ClusteredFlags::QUIESCED));
        for _ in 0..5 {
            r.cycle();
        }
        assert_eq!(r.rg.info().rw_verify_checkpoint, before);

        // A second quiesce changes nothing.
        assert!(!r.rg.request_quiesce());
        assert!(r.rg.flags().contains(ClusteredFlags::QUIESCED));

        r.rg.request_unquiesce();
        r.cycle();
        assert!(!r.rg.flags().contains(ClusteredFlags::QUIESCED));
        assert!(r.rg.info().rw_verify_checkpoint > before);
    }

    #[test]
    fn media_errors_are_found_then_corrected() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        r.rg.inject_media_error(Position(1), Lba(0x1900)).unwrap();
        assert!(r.rg.inject_media_error(Position(5), Lba(0)).is_err());
        assert!(r.rg.inject_media_error(Position(0), Lba(CAPACITY)).is_err());

        r.rg.queue_verify(VerifyType::ReadWrite);
        r.settle();
        let report = r.rg.info().verify_report;
        assert_eq!(report.errors_found, 1);
        assert_eq!(report.errors_corrected, 1);
        assert_eq!(report.uncorrectable_errors, 0);

        // Nothing left for the next pass to find.
        r.rg.queue_verify(VerifyType::ReadOnly);
        r.settle();
        assert_eq!(r.rg.info().verify_report.errors_found, 1);
    }

    #[test]
    fn rebuild_over_bad_survivor_is_uncorrectable() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        r.rg.inject_media_error(Position(3), Lba(0x800)).unwrap();
        let h = r.pull(0);
        r.cycle();
        r.reinsert(0, h);
        r.cycle_until(|i| i.rebuild_is_finished());
        assert_eq!(r.rg.info().verify_report.uncorrectable_errors, 1);
        assert_eq!(r.rg.lifecycle(), LifecycleState::Ready);

        // The bad chunk is queued for an error verify.
        let info = r.rg.info();
        assert_eq!(info.error_verify_checkpoint, Some(Lba(0x800)));
        assert!(!info.verify_is_finished());
        r.cycle_until(|i| i.verify_is_finished());
        assert_eq!(r.rg.info().verify_report.errors_corrected, 1);
    }

    #[test]
    fn short_glitch_is_not_a_removal() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.settle();
        r.db
            .drives
            .glitch(r.drives[4], Duration::from_millis(500), r.now)
            .unwrap();
        for _ in 0..10 {
            r.cycle();
            assert!(!r.rg.info().is_degraded());
        }
    }

    #[test]
    fn permanent_spare_swaps_in() {
        let mut r = Rig::new(RaidType::Raid5, 5);
        r.cfg.permanent_spare_trigger = Some(Duration::from_secs(1));
        let spare = r.drives[5];
        execute(&mut r.db, SpId::A, &JobRequest::ConfigureHotSpare(spare))
            .unwrap();
        r.settle();

        let _h = r.pull(3);
        let mut swapped = false;
        for _ in 0..20 {
            swapped |= r.cycle().config_changed;
        }
        assert!(swapped);
        assert_eq!(r.rg.members[3], spare);
        assert_eq!(r.db.raid_groups[&r.rg.id].members[3], spare);
        r.cycle_until(|i| i.rebuild_is_finished());
        assert!(!r.rg.info().is_degraded());
    }

    #[test]
    fn rebuild_end_state_ignores_chunk_count() {
        let run = |chunks: u32| {
            let mut r = Rig::new(RaidType::Raid6, 6);
            r.cfg.set_chunks_per_rebuild(chunks).unwrap();
            r.settle();
            let h = r.pull(4);
            r.cycle();
            r.reinsert(4, h);
            r.settle();
            let mut info = r.rg.info();
            info.base_config_clustered_flags = ClusteredFlags::empty();
            info
        };
        let baseline = run(1);
        for chunks in 2..=crate::background::MAX_CHUNKS_PER_REBUILD {
            assert_eq!(run(chunks), baseline, "chunks {chunks}");
        }
    }

    #[test]
    fn passive_copy_takes_snapshots() {
        let r = Rig::new(RaidType::Raid5, 5);
        let mut passive = RaidGroup::new(
            &r.db.raid_groups[&r.rg.id],
            MetadataElementState::Passive,
            DEFAULT_CHUNK_SIZE,
            &build_logger(),
        );
        let mut snap = r.rg.info();
        snap.rw_verify_checkpoint = Some(Lba(0x1000));
        passive.apply_snapshot(&snap);
        let info = passive.info();
        assert_eq!(info.metadata_element_state, MetadataElementState::Passive);
        assert_eq!(info.rw_verify_checkpoint, Some(Lba(0x1000)));

        passive.set_peer_flags(ClusteredFlags::QUIESCED);
        assert!(passive.info().is_quiesced());
    }
}
