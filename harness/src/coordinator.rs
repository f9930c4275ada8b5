// Copyright 2023 Oxide Computer Company
//! Waiting on the engine: quiesce, lifecycle, rebuild, verify and peer
//! convergence.  Every wait polls fresh state; nothing is cached.
use futures::future::try_join_all;
use sep_common::{
    composite_is_degraded, ClusteredFlags, DegradedBitmask, LifecycleState,
    Lba, ObjectId, Position, RaidGroupInfo, RaidType, SepError, VerifyType,
};
use slog::{debug, info};

use crate::poll::poll_until;
use crate::position::RaidGroupConfig;
use crate::session::TestSession;

impl TestSession {
    /// Objects that carry this raid group's background state
    ///
    /// A RAID10 does its work in its mirrors, so those are returned in
    /// place of the striper.
    pub async fn mirror_objects(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<Vec<ObjectId>, SepError> {
        let object = rg.object_id()?;
        if rg.raid_type() == RaidType::Raid10 {
            self.nodes.local().get_downstream_objects(object).await
        } else {
            Ok(vec![object])
        }
    }

    /// Current state from the SP that owns `object`
    pub async fn raid_group_info(
        &self,
        object: ObjectId,
    ) -> Result<RaidGroupInfo, SepError> {
        self.nodes.active(object).await?.get_raid_group_info(object).await
    }

    async fn mirror_infos(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<Vec<RaidGroupInfo>, SepError> {
        let mut infos = Vec::new();
        for o in self.mirror_objects(rg).await? {
            infos.push(self.raid_group_info(o).await?);
        }
        Ok(infos)
    }

    pub async fn is_raid_group_degraded(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<bool, SepError> {
        Ok(composite_is_degraded(&self.mirror_infos(rg).await?))
    }

    /// Whether every SP's copy of the clustered flags satisfies `want`
    ///
    /// The Passive SP only learns of a new object, or of a flag change,
    /// once the Active SP tells it, so not knowing the object yet counts
    /// as not there.
    async fn flags_everywhere(
        &self,
        object: ObjectId,
        want: impl Fn(ClusteredFlags) -> bool,
    ) -> Result<bool, SepError> {
        let active = self.nodes.active(object).await?.sp();
        for h in self.nodes.all() {
            match h.get_clustered_flags(object).await {
                Ok(f) if want(f) => (),
                Ok(_) => return Ok(false),
                Err(SepError::ObjectNotFound(_)) if h.sp() != active => {
                    return Ok(false)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Ask for a quiesce, optionally waiting until it is held
    pub async fn quiesce_raid_group(
        &self,
        rg: &RaidGroupConfig,
        wait: bool,
    ) -> Result<(), SepError> {
        let targets = self.mirror_objects(rg).await?;
        for t in &targets {
            info!(self.log, "quiesce {}", t;
                "raid_group" => rg.raid_group_id());
            self.nodes.local().quiesce(*t).await?;
        }
        if wait {
            try_join_all(targets.iter().map(|t| self.wait_for_quiesced(*t)))
                .await?;
        }
        Ok(())
    }

    pub async fn unquiesce_raid_group(
        &self,
        rg: &RaidGroupConfig,
        wait: bool,
    ) -> Result<(), SepError> {
        let targets = self.mirror_objects(rg).await?;
        for t in &targets {
            info!(self.log, "unquiesce {}", t;
                "raid_group" => rg.raid_group_id());
            self.nodes.local().unquiesce(*t).await?;
        }
        if wait {
            try_join_all(targets.iter().map(|t| self.wait_for_unquiesced(*t)))
                .await?;
        }
        Ok(())
    }

    /// Request every quiesce before waiting on any of them
    ///
    /// The second pass re-requests, which is a no-op on an object that is
    /// already quiescing.
    pub async fn quiesce_all_raid_groups(
        &self,
        rgs: &[RaidGroupConfig],
        wait: bool,
    ) -> Result<(), SepError> {
        for rg in rgs {
            self.quiesce_raid_group(rg, false).await?;
        }
        if wait {
            for rg in rgs {
                self.quiesce_raid_group(rg, true).await?;
            }
        }
        Ok(())
    }

    pub async fn unquiesce_all_raid_groups(
        &self,
        rgs: &[RaidGroupConfig],
        wait: bool,
    ) -> Result<(), SepError> {
        for rg in rgs {
            self.unquiesce_raid_group(rg, false).await?;
        }
        if wait {
            for rg in rgs {
                self.unquiesce_raid_group(rg, true).await?;
            }
        }
        Ok(())
    }

    /// Wait until every SP shows `QUIESCED` for `object`
    pub async fn wait_for_quiesced(
        &self,
        object: ObjectId,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("quiesce of {}", object),
            self.cfg.quiesce_poll_interval(),
            self.cfg.quiesce_timeout(),
            || async move {
                self.flags_everywhere(object, |f| {
                    f.contains(ClusteredFlags::QUIESCED)
                })
                .await
            },
        )
        .await
    }

    pub async fn wait_for_unquiesced(
        &self,
        object: ObjectId,
    ) -> Result<(), SepError> {
        let held = ClusteredFlags::QUIESCING
            | ClusteredFlags::QUIESCED
            | ClusteredFlags::UNQUIESCING;
        poll_until(
            &format!("unquiesce of {}", object),
            self.cfg.quiesce_poll_interval(),
            self.cfg.quiesce_timeout(),
            || async move {
                self.flags_everywhere(object, |f| !f.intersects(held)).await
            },
        )
        .await
    }

    pub async fn wait_for_lifecycle(
        &self,
        object: ObjectId,
        state: LifecycleState,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("{} to reach {:?}", object, state),
            self.cfg.poll_interval(),
            self.cfg.job_timeout(),
            || async move {
                Ok(self.raid_group_info(object).await?.lifecycle_state == state)
            },
        )
        .await
    }

    pub async fn wait_for_degraded_bitmask(
        &self,
        object: ObjectId,
        mask: DegradedBitmask,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("{} degraded bitmask {}", object, mask),
            self.cfg.poll_interval(),
            self.cfg.job_timeout(),
            || async move {
                let got =
                    self.raid_group_info(object).await?.degraded_bitmask();
                debug!(self.log, "{} degraded {}", object, got);
                Ok(got == mask)
            },
        )
        .await
    }

    /// Wait until no mirror is rebuilding or missing a drive
    pub async fn wait_for_rebuild_complete(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("rebuild of raid group {}", rg.raid_group_id()),
            self.cfg.poll_interval(),
            self.cfg.rebuild_timeout(),
            || async move {
                let infos = self.mirror_infos(rg).await?;
                if let Some(i) = infos
                    .iter()
                    .find(|i| i.lifecycle_state == LifecycleState::Fail)
                {
                    return Err(SepError::RaidGroupFailed(i.object_id));
                }
                Ok(infos
                    .iter()
                    .all(|i| i.rebuild_is_finished() && !i.is_degraded()))
            },
        )
        .await?;
        info!(self.log, "raid group {} rebuilt", rg.raid_group_id());
        Ok(())
    }

    pub async fn initiate_verify(
        &self,
        rg: &RaidGroupConfig,
        verify_type: VerifyType,
    ) -> Result<(), SepError> {
        let object = rg.object_id()?;
        info!(self.log, "{} verify of {}", verify_type, object);
        self.nodes.local().initiate_verify(object, verify_type).await
    }

    pub async fn inject_media_error(
        &self,
        rg: &RaidGroupConfig,
        position: Position,
        lba: Lba,
    ) -> Result<(), SepError> {
        let object = rg.object_id()?;
        self.nodes
            .local()
            .inject_media_error(object, position, lba)
            .await
    }

    pub async fn wait_for_verify_finished(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("verify of raid group {}", rg.raid_group_id()),
            self.cfg.poll_interval(),
            self.cfg.verify_timeout(),
            || async move {
                let infos = self.mirror_infos(rg).await?;
                Ok(infos.iter().all(|i| i.verify_is_finished()))
            },
        )
        .await
    }

    pub async fn wait_for_zeroing_complete(
        &self,
        rg: &RaidGroupConfig,
    ) -> Result<(), SepError> {
        poll_until(
            &format!("zeroing of raid group {}", rg.raid_group_id()),
            self.cfg.poll_interval(),
            self.cfg.verify_timeout(),
            || async move {
                let infos = self.mirror_infos(rg).await?;
                Ok(infos.iter().all(|i| i.zeroing_is_finished()))
            },
        )
        .await
    }

    /// Wait until the passive SP's copy matches the active one
    ///
    /// Only meaningful once background work on the object has stopped,
    /// otherwise the active copy keeps moving between snapshots.
    pub async fn wait_for_peer_convergence(
        &self,
        object: ObjectId,
    ) -> Result<(), SepError> {
        let timeout = self.cfg.update_peer_checkpoint_interval() * 3;
        poll_until(
            &format!("peer copy of {}", object),
            self.cfg.poll_interval(),
            timeout.max(self.cfg.job_timeout()),
            || async move {
                let Some(passive) = self.nodes.passive(object).await? else {
                    return Ok(true);
                };
                let active = self.nodes.active(object).await?;
                let mut a = active.get_raid_group_info(object).await?;
                let b = passive.get_raid_group_info(object).await?;
                a.metadata_element_state = b.metadata_element_state;
                Ok(a == b)
            },
        )
        .await
    }
}
