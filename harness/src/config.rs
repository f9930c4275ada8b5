// Copyright 2023 Oxide Computer Company
//! Raid group, LUN and spare configuration, plus pulling and reinserting
//! member drives.  Jobs are submitted and then waited on with the
//! session's job timeout.
use sep::SepHandle;
use sep_common::{
    DriveLocation, JobNumber, JobResult, ObjectId, Position, RaidType,
    SepError,
};
use slog::{info, warn};

use crate::position::{RaidGroupConfig, RemovalMode};
use crate::session::TestSession;

impl TestSession {
    pub async fn wait_for_job(
        &self,
        h: &SepHandle,
        job: JobNumber,
    ) -> Result<JobResult, SepError> {
        match tokio::time::timeout(self.cfg.job_timeout(), h.wait_for_job(job))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(SepError::Timeout(format!(
                "job {} after {:?}",
                job,
                self.cfg.job_timeout()
            ))),
        }
    }

    /// Wait for a job that has to succeed
    async fn job_ok(
        &self,
        h: &SepHandle,
        job: JobNumber,
    ) -> Result<Option<ObjectId>, SepError> {
        let r = self.wait_for_job(h, job).await?;
        if !r.is_success() {
            warn!(self.log, "job {} refused: {:?}", job, r.error_code);
            return Err(SepError::JobRejected(r.error_code));
        }
        Ok(r.object_id)
    }

    pub async fn create_raid_group(
        &self,
        rg: &mut RaidGroupConfig,
    ) -> Result<ObjectId, SepError> {
        let h = self.nodes.local();
        let job = h.create_raid_group(rg.create_request()).await?;
        let object = self.job_ok(h, job).await?.ok_or_else(|| {
            SepError::InvalidConfiguration(format!(
                "job {} created no raid group",
                job
            ))
        })?;
        rg.set_object_id(Some(object));
        info!(
            self.log,
            "raid group {} is {}", rg.raid_group_id(), object;
            "raid_type" => ?rg.raid_type(),
            "width" => rg.width()
        );
        Ok(object)
    }

    /// Destroy a raid group, handing back the job result untouched
    ///
    /// A raid group that still has LUNs is refused with
    /// `RequestObjectHasUpstreamEdges` while the job itself completes Ok,
    /// so callers look at the error code rather than the `Result`.
    pub async fn destroy_raid_group(
        &self,
        rg: &mut RaidGroupConfig,
    ) -> Result<JobResult, SepError> {
        let object = rg.object_id()?;
        let h = self.nodes.local();
        let job = h.destroy_raid_group(object).await?;
        let r = self.wait_for_job(h, job).await?;
        if r.is_success() {
            info!(self.log, "raid group {} destroyed", rg.raid_group_id());
            rg.set_object_id(None);
        }
        Ok(r)
    }

    pub async fn create_lun(
        &self,
        rg: &RaidGroupConfig,
        capacity: u64,
    ) -> Result<ObjectId, SepError> {
        let h = self.nodes.local();
        let job = h.create_lun(rg.object_id()?, capacity).await?;
        self.job_ok(h, job)
            .await?
            .ok_or_else(|| SepError::InvalidConfiguration("no LUN".into()))
    }

    pub async fn destroy_lun(&self, lun: ObjectId) -> Result<(), SepError> {
        let h = self.nodes.local();
        let job = h.destroy_lun(lun).await?;
        self.job_ok(h, job).await.map(|_| ())
    }

    pub async fn configure_hot_spare(
        &self,
        location: DriveLocation,
    ) -> Result<(), SepError> {
        let h = self.nodes.local();
        let job = h.configure_hot_spare(location).await?;
        self.job_ok(h, job).await?;
        info!(self.log, "{} is a hot spare", location);
        Ok(())
    }

    /// Pull the drive at the next position `mode` picks
    pub fn remove_position(
        &mut self,
        rg: &mut RaidGroupConfig,
        mode: &RemovalMode,
    ) -> Result<Position, SepError> {
        let position = rg
            .get_next_position_to_remove(mode, &mut self.rng)
            .ok_or(SepError::NoPositionAvailable)?;
        let location = rg.drive_at(position)?;
        let handle = self.array.pull_drive(location)?;
        rg.add_removed_position(position)?;
        rg.stash_pulled(position, handle);
        info!(
            self.log,
            "removed position {} of raid group {}",
            position,
            rg.raid_group_id();
            "drive" => %location
        );
        Ok(position)
    }

    /// Put back the most recently pulled drive that is still out
    pub fn insert_position(
        &mut self,
        rg: &mut RaidGroupConfig,
    ) -> Result<Position, SepError> {
        let position = rg
            .get_next_position_to_insert()
            .ok_or(SepError::NoPositionAvailable)?;
        let handle = rg
            .take_pulled(position)
            .ok_or(SepError::PositionNotRemoved(position))?;
        let location = rg.drive_at(position)?;
        if let Err(e) = self.array.reinsert_drive(location, handle.clone()) {
            // Still out; keep the handle for another try.
            rg.stash_pulled(position, handle);
            return Err(e);
        }
        rg.removed_position_inserted(position)?;
        info!(
            self.log,
            "reinserted position {} of raid group {}",
            position,
            rg.raid_group_id();
            "drive" => %location
        );
        Ok(position)
    }

    /// Replace a removed position with `spare` for good
    ///
    /// For a RAID10 the swap happens in the mirror that holds the
    /// position.
    pub async fn spare_position(
        &self,
        rg: &mut RaidGroupConfig,
        position: Position,
        spare: DriveLocation,
    ) -> Result<(), SepError> {
        if !rg.is_removed(position) {
            return Err(SepError::PositionNotRemoved(position));
        }
        let object = rg.object_id()?;
        let (target, target_pos) = if rg.raid_type() == RaidType::Raid10 {
            let mirrors = self.mirror_objects(rg).await?;
            let m = mirrors
                .get(position.get() / 2)
                .copied()
                .ok_or(SepError::InvalidPosition(position))?;
            (m, Position::new(position.get() % 2))
        } else {
            (object, position)
        };

        self.configure_hot_spare(spare).await?;
        let h = self.nodes.active(target).await?;
        let job = h.swap_in_spare(target, target_pos, spare).await?;
        self.job_ok(h, job).await?;

        rg.replace_drive(position, spare)?;
        rg.removed_position_inserted(position)?;
        if rg.needs_spare(position) {
            rg.delete_needing_spare_position(position)?;
        }
        info!(
            self.log,
            "spared position {} of raid group {}",
            position,
            rg.raid_group_id();
            "drive" => %spare
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::position::{RaidGroupConfig, RemovalMode};
    use crate::session::{TestSession, TestSessionConfig};
    use sep_common::{
        build_logger, DegradedBitmask, DriveLocation, JobErrorCode,
        JobStatus, Position, RaidType, SepError,
    };

    fn raid5(id: u32) -> RaidGroupConfig {
        let drives = (0..5).map(|s| DriveLocation::new(0, 0, s)).collect();
        RaidGroupConfig::new(id, RaidType::Raid5, drives, 0x8000).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_and_destroy() {
        let s =
            TestSession::start(TestSessionConfig::default(), &build_logger())
                .unwrap();
        let mut rg = raid5(3);
        let object = s.create_raid_group(&mut rg).await.unwrap();
        assert_eq!(s.nodes.local().lookup_raid_group(3).await, Ok(object));

        // Same drives again are refused.
        let mut dup = raid5(4);
        assert_eq!(
            s.create_raid_group(&mut dup).await,
            Err(SepError::JobRejected(JobErrorCode::PvdIsInUseForRaidGroup))
        );

        let lun = s.create_lun(&rg, 0x1000).await.unwrap();
        let r = s.destroy_raid_group(&mut rg).await.unwrap();
        assert_eq!(r.status, JobStatus::Ok);
        assert_eq!(r.error_code, JobErrorCode::RequestObjectHasUpstreamEdges);
        assert_eq!(rg.object_id(), Ok(object));

        s.destroy_lun(lun).await.unwrap();
        let r = s.destroy_raid_group(&mut rg).await.unwrap();
        assert!(r.is_success());
        assert_eq!(rg.object_id(), Err(SepError::NotConfigured));
        assert_eq!(
            s.nodes.local().lookup_raid_group(3).await,
            Err(SepError::RaidGroupNumberNotFound(3))
        );
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pull_and_reinsert_tracks_positions() {
        let mut s =
            TestSession::start(TestSessionConfig::default(), &build_logger())
                .unwrap();
        let mut rg = raid5(1);
        let object = s.create_raid_group(&mut rg).await.unwrap();

        let specific = RemovalMode::Specific(vec![Position(2)]);
        assert_eq!(s.remove_position(&mut rg, &specific), Ok(Position(2)));
        s.wait_for_degraded_bitmask(object, DegradedBitmask(0b00100))
            .await
            .unwrap();
        assert!(s.is_raid_group_degraded(&rg).await.unwrap());

        assert_eq!(s.insert_position(&mut rg), Ok(Position(2)));
        assert_eq!(rg.num_removed(), 0);
        assert_eq!(
            s.insert_position(&mut rg),
            Err(SepError::NoPositionAvailable)
        );
        s.wait_for_rebuild_complete(&rg).await.unwrap();
        assert!(!s.is_raid_group_degraded(&rg).await.unwrap());
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reinsert_keeps_the_position_out() {
        let mut s =
            TestSession::start(TestSessionConfig::default(), &build_logger())
                .unwrap();
        let mut rg = raid5(1);
        s.create_raid_group(&mut rg).await.unwrap();
        let p = s.remove_position(&mut rg, &RemovalMode::Sequential).unwrap();

        // Someone else filled the slot, so the pulled drive cannot go back.
        let location = rg.drive_at(p).unwrap();
        s.array.insert_new_drive(location, 0x20000).unwrap();
        assert_eq!(
            s.insert_position(&mut rg),
            Err(SepError::DriveHandleMismatch(location))
        );
        assert!(rg.is_removed(p));
        assert_eq!(rg.get_next_position_to_insert(), Some(p));
        assert!(rg.take_pulled(p).is_some());
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn spare_replaces_a_pulled_drive() {
        let mut s =
            TestSession::start(TestSessionConfig::default(), &build_logger())
                .unwrap();
        let mut rg = raid5(1);
        let object = s.create_raid_group(&mut rg).await.unwrap();
        let p = s.remove_position(&mut rg, &RemovalMode::Sequential).unwrap();
        assert_eq!(p, Position(0));
        rg.add_needing_spare_position(p).unwrap();
        s.wait_for_degraded_bitmask(object, DegradedBitmask(0b1))
            .await
            .unwrap();

        let spare = DriveLocation::new(0, 1, 0);
        s.spare_position(&mut rg, p, spare).await.unwrap();
        assert_eq!(rg.drive_at(p), Ok(spare));
        assert!(!rg.needs_spare(p));
        assert!(!rg.is_removed(p));
        s.wait_for_rebuild_complete(&rg).await.unwrap();
        s.shutdown().await;
    }
}
