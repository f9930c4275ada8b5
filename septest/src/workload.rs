// Copyright 2023 Oxide Computer Company
use std::time::Duration;

use anyhow::{bail, Result};
use rand::Rng;
use sep_common::{
    ClusteredFlags, DegradedBitmask, DriveLocation, JobErrorCode, JobStatus,
    Lba, Position, RaidType, VerifyReport, VerifyType,
};
use sep_harness::{poll_until, RaidGroupConfig, RemovalMode, TestSession};
use serde::{Deserialize, Serialize};
use slog::{info, warn};
use strum::IntoEnumIterator;

/// What a run did, written out with `--report`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub array: String,
    pub dualsp: bool,
    pub seed: u64,
    pub chunks_per_rebuild: u32,
    pub workloads: Vec<String>,
    pub removals: usize,
    pub insertions: usize,
    /// Final verify counters per raid group number
    pub verify: Vec<(u32, VerifyReport)>,
}

impl RunReport {
    pub fn new(session: &TestSession) -> Self {
        RunReport {
            array: session.array.id().to_string(),
            dualsp: session.cfg.dualsp,
            seed: session.cfg.seed,
            chunks_per_rebuild: session.cfg.chunks_per_rebuild,
            ..Default::default()
        }
    }
}

fn drives(enclosure: u32, slots: std::ops::Range<u32>) -> Vec<DriveLocation> {
    slots.map(|s| DriveLocation::new(0, enclosure, s)).collect()
}

async fn teardown(
    session: &TestSession,
    rg: &mut RaidGroupConfig,
) -> Result<()> {
    let r = session.destroy_raid_group(rg).await?;
    if !r.is_success() {
        bail!("destroy of raid group {} refused: {:?}", rg.raid_group_id(), r);
    }
    Ok(())
}

async fn record_verify(
    session: &TestSession,
    report: &mut RunReport,
    rg: &RaidGroupConfig,
) -> Result<()> {
    let info = session.raid_group_info(rg.object_id()?).await?;
    report.verify.push((rg.raid_group_id(), info.verify_report));
    Ok(())
}

/// Remove position 0 of a width-5 RAID5, check it shows degraded, put it
/// back and wait for the rebuild.
pub async fn degraded_workload(
    session: &mut TestSession,
    report: &mut RunReport,
) -> Result<()> {
    report.workloads.push("degraded".to_string());
    let mut rg =
        RaidGroupConfig::new(10, RaidType::Raid5, drives(0, 0..5), 0x10000)?;
    let object = session.create_raid_group(&mut rg).await?;

    let p = session
        .remove_position(&mut rg, &RemovalMode::Specific(vec![Position(0)]))?;
    report.removals += 1;
    session
        .wait_for_degraded_bitmask(
            object,
            DegradedBitmask::from_positions(&[p]),
        )
        .await?;
    if !session.is_raid_group_degraded(&rg).await? {
        bail!("raid group {} is not degraded with {} out", object, p);
    }

    if session.cfg.error_injection {
        // Lost for good: the only other copy is on the missing drive.
        session
            .inject_media_error(&rg, Position(1), Lba(0x100))
            .await?;
    }

    session.insert_position(&mut rg)?;
    report.insertions += 1;
    session.wait_for_rebuild_complete(&rg).await?;
    if session.is_raid_group_degraded(&rg).await? {
        bail!("raid group {} still degraded after rebuild", object);
    }
    record_verify(session, report, &rg).await?;
    teardown(session, &mut rg).await
}

/// Quiesce a width-4 RAID10 and check each mirror reports `QUIESCED`.
pub async fn raid10_quiesce_workload(
    session: &mut TestSession,
    report: &mut RunReport,
) -> Result<()> {
    report.workloads.push("raid10_quiesce".to_string());
    let mut rg =
        RaidGroupConfig::new(11, RaidType::Raid10, drives(0, 5..9), 0x10000)?;
    session.create_raid_group(&mut rg).await?;

    session.quiesce_raid_group(&rg, true).await?;
    // The passive SP hears about the flag change a moment later.
    for m in session.mirror_objects(&rg).await? {
        for h in session.nodes.all() {
            poll_until(
                &format!("mirror {} quiesced on {}", m, h.sp()),
                session.cfg.poll_interval(),
                session.cfg.quiesce_timeout(),
                || async move {
                    let flags = h.get_clustered_flags(m).await?;
                    Ok(flags.contains(ClusteredFlags::QUIESCED))
                },
            )
            .await?;
        }
    }
    session.unquiesce_raid_group(&rg, true).await?;
    teardown(session, &mut rg).await
}

/// A raid group with a LUN bound refuses to be destroyed.
pub async fn destroy_with_luns_workload(
    session: &mut TestSession,
    report: &mut RunReport,
) -> Result<()> {
    report.workloads.push("destroy_with_luns".to_string());
    let mut rg =
        RaidGroupConfig::new(12, RaidType::Raid5, drives(0, 9..12), 0x10000)?;
    let object = session.create_raid_group(&mut rg).await?;
    let lun = session.create_lun(&rg, 0x8000).await?;

    let r = session.destroy_raid_group(&mut rg).await?;
    if r.status != JobStatus::Ok
        || r.error_code != JobErrorCode::RequestObjectHasUpstreamEdges
    {
        bail!("destroy with a LUN bound gave {:?}", r);
    }
    let found = session.nodes.local().lookup_raid_group(12).await?;
    if found != object {
        bail!("raid group 12 is now {}, expected {}", found, object);
    }

    session.destroy_lun(lun).await?;
    teardown(session, &mut rg).await
}

/// Run each verify type to completion on a fresh RAID6.
pub async fn verify_workload(
    session: &mut TestSession,
    report: &mut RunReport,
) -> Result<()> {
    report.workloads.push("verify".to_string());
    let mut rg =
        RaidGroupConfig::new(13, RaidType::Raid6, drives(1, 0..4), 0x10000)?;
    session.create_raid_group(&mut rg).await?;
    session.wait_for_zeroing_complete(&rg).await?;
    session.wait_for_verify_finished(&rg).await?;

    for vt in VerifyType::iter() {
        if session.cfg.error_injection && vt == VerifyType::ReadWrite {
            let lba = Lba(session.rng.gen_range(0..rg.capacity()));
            let pos = Position::new(session.rng.gen_range(0..rg.width()));
            info!(session.log, "media error at {} {}", pos, lba);
            session.inject_media_error(&rg, pos, lba).await?;
        }
        session.initiate_verify(&rg, vt).await?;
        session.wait_for_verify_finished(&rg).await?;
    }

    let info = session.raid_group_info(rg.object_id()?).await?;
    if info.verify_report.errors_found != info.verify_report.errors_corrected {
        warn!(session.log, "uncorrected errors";
            "report" => ?info.verify_report);
    }
    record_verify(session, report, &rg).await?;
    teardown(session, &mut rg).await
}

/// Cut the link while a verify runs, restore it, and wait for the passive
/// copy to catch up.
pub async fn peer_sync_workload(
    session: &mut TestSession,
    report: &mut RunReport,
) -> Result<()> {
    report.workloads.push("peer_sync".to_string());
    let mut rg =
        RaidGroupConfig::new(14, RaidType::Raid5, drives(1, 4..7), 0x10000)?;
    let object = session.create_raid_group(&mut rg).await?;

    session.initiate_verify(&rg, VerifyType::ReadWrite).await?;
    session.array.set_peer_alive(false)?;
    tokio::time::sleep(Duration::from_secs(3)).await;
    session.array.set_peer_alive(true)?;

    session.wait_for_zeroing_complete(&rg).await?;
    session.wait_for_verify_finished(&rg).await?;
    session.wait_for_peer_convergence(object).await?;
    record_verify(session, report, &rg).await?;
    teardown(session, &mut rg).await
}

/// Pull one or two random positions of a RAID6 at a time, check the
/// degraded bitmask matches, then put them back LIFO and rebuild.
pub async fn random_workload(
    session: &mut TestSession,
    report: &mut RunReport,
    count: usize,
) -> Result<()> {
    report.workloads.push("random".to_string());
    let mut rg =
        RaidGroupConfig::new(15, RaidType::Raid6, drives(1, 7..13), 0x8000)?;
    let object = session.create_raid_group(&mut rg).await?;
    let tolerated = rg.raid_type().tolerated_failures(rg.width());

    for round in 0..count {
        let pulls = session.rng.gen_range(1..=tolerated);
        for _ in 0..pulls {
            session.remove_position(&mut rg, &RemovalMode::Random)?;
            report.removals += 1;
        }
        let mask = DegradedBitmask::from_positions(&rg.removed_positions());
        info!(session.log, "round {} pulled {}", round, mask);
        session.wait_for_degraded_bitmask(object, mask).await?;

        while rg.num_removed() > 0 {
            session.insert_position(&mut rg)?;
            report.insertions += 1;
        }
        session.wait_for_rebuild_complete(&rg).await?;
    }
    teardown(session, &mut rg).await
}
