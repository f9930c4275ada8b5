// Copyright 2023 Oxide Computer Company
//! Job service
//!
//! Configuration changes are submitted as jobs, queued, and executed on
//! the next monitor cycle.  A job can run to completion and still refuse
//! the request, in which case the result carries `JobStatus::Ok` together
//! with a [`JobErrorCode`].
use std::collections::{BTreeMap, VecDeque};

use ringbuffer::{AllocRingBuffer, RingBuffer};
use sep_common::{
    DriveLocation, JobErrorCode, JobNumber, JobResult, ObjectId, Position,
    RaidType, SepError, SpId,
};
use tokio::sync::oneshot;

use crate::db::{LunRecord, RaidGroupRecord, SystemDb};
use crate::drive::DriveUse;

/// How many finished jobs stay around for a late `wait_for_job`
const COMPLETED_JOBS: usize = 256;

/// Request to create a raid group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaidGroupCreate {
    pub raid_group_id: u32,
    pub raid_type: RaidType,
    /// One drive per member position
    pub drives: Vec<DriveLocation>,
    /// Blocks to use on each member
    pub capacity: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JobRequest {
    CreateRaidGroup(RaidGroupCreate),
    DestroyRaidGroup(ObjectId),
    CreateLun {
        raid_group: ObjectId,
        capacity: u64,
    },
    DestroyLun(ObjectId),
    ConfigureHotSpare(DriveLocation),
    SwapInSpare {
        object: ObjectId,
        position: Position,
        spare: DriveLocation,
    },
}

type JobWaiter = oneshot::Sender<Result<JobResult, SepError>>;

/// Per-node table of queued, finished and waited-on jobs
#[derive(Debug)]
pub(crate) struct JobTable {
    queued: VecDeque<(JobNumber, JobRequest)>,
    waiters: BTreeMap<JobNumber, Vec<JobWaiter>>,
    completed: AllocRingBuffer<(JobNumber, JobResult)>,
}

impl JobTable {
    pub fn new() -> Self {
        JobTable {
            queued: VecDeque::new(),
            waiters: BTreeMap::new(),
            completed: AllocRingBuffer::new(COMPLETED_JOBS),
        }
    }

    pub fn submit(&mut self, job: JobNumber, req: JobRequest) {
        self.queued.push_back((job, req));
    }

    pub fn take_queued(&mut self) -> Vec<(JobNumber, JobRequest)> {
        self.queued.drain(..).collect()
    }

    fn result(&self, job: JobNumber) -> Option<JobResult> {
        self.completed
            .iter()
            .find(|(j, _)| *j == job)
            .map(|(_, r)| *r)
    }

    fn is_queued(&self, job: JobNumber) -> bool {
        self.queued.iter().any(|(j, _)| *j == job)
    }

    /// Reply now if the job is done, otherwise park the waiter
    pub fn wait(&mut self, job: JobNumber, res: JobWaiter) {
        if let Some(r) = self.result(job) {
            let _ = res.send(Ok(r));
        } else if self.is_queued(job) {
            self.waiters.entry(job).or_default().push(res);
        } else {
            let _ = res.send(Err(SepError::InvalidArgument(format!(
                "unknown job {job}"
            ))));
        }
    }

    pub fn complete(&mut self, job: JobNumber, r: JobResult) {
        self.completed.push((job, r));
        for w in self.waiters.remove(&job).unwrap_or_default() {
            let _ = w.send(Ok(r));
        }
    }
}

/// Run a job against the database
///
/// On success returns the object the job created, if any.  Nothing in the
/// database changes when an error code is returned.
pub(crate) fn execute(
    db: &mut SystemDb,
    sp: SpId,
    req: &JobRequest,
) -> Result<Option<ObjectId>, JobErrorCode> {
    match req {
        JobRequest::CreateRaidGroup(c) => {
            create_raid_group(db, sp, c).map(Some)
        }
        JobRequest::DestroyRaidGroup(object) => {
            destroy_raid_group(db, *object).map(|_| None)
        }
        JobRequest::CreateLun {
            raid_group,
            capacity,
        } => create_lun(db, *raid_group, *capacity).map(Some),
        JobRequest::DestroyLun(lun) => match db.luns.remove(lun) {
            Some(_) => Ok(None),
            None => Err(JobErrorCode::ObjectNotFound),
        },
        JobRequest::ConfigureHotSpare(location) => {
            configure_hot_spare(db, *location).map(|_| None)
        }
        JobRequest::SwapInSpare {
            object,
            position,
            spare,
        } => swap_in_spare(db, *object, *position, *spare).map(|_| None),
    }
}

fn check_drive_free(
    db: &SystemDb,
    location: DriveLocation,
) -> Result<u64, JobErrorCode> {
    let Some(d) = db.drives.get(location) else {
        return Err(JobErrorCode::DriveNotFound);
    };
    match d.used_by {
        DriveUse::Unbound => Ok(d.capacity),
        DriveUse::HotSpare => Err(JobErrorCode::PvdIsConfiguredAsSpare),
        DriveUse::RaidGroup(_) => Err(JobErrorCode::PvdIsInUseForRaidGroup),
    }
}

fn create_raid_group(
    db: &mut SystemDb,
    sp: SpId,
    c: &RaidGroupCreate,
) -> Result<ObjectId, JobErrorCode> {
    if db.lookup_raid_group(c.raid_group_id).is_some() {
        return Err(JobErrorCode::InvalidRaidGroupNumber);
    }
    let width = c.drives.len();
    if !c.raid_type.valid_width(width) || c.capacity == 0 {
        return Err(JobErrorCode::InvalidConfiguration);
    }
    for (i, loc) in c.drives.iter().enumerate() {
        if c.drives[..i].contains(loc) {
            return Err(JobErrorCode::InvalidConfiguration);
        }
        if check_drive_free(db, *loc)? < c.capacity {
            return Err(JobErrorCode::InvalidConfiguration);
        }
    }

    let object_id = db.alloc_object_id();
    let mut downstream = Vec::new();
    if c.raid_type == RaidType::Raid10 {
        for pair in c.drives.chunks(2) {
            let mirror = db.alloc_object_id();
            for loc in pair {
                db.drives.set_use(*loc, DriveUse::RaidGroup(mirror));
            }
            db.raid_groups.insert(
                mirror,
                RaidGroupRecord {
                    object_id: mirror,
                    raid_group_id: None,
                    raid_type: RaidType::Raid1,
                    width: pair.len(),
                    capacity: c.capacity,
                    members: pair.to_vec(),
                    downstream: vec![],
                    parent: Some(object_id),
                    active_sp: sp,
                },
            );
            downstream.push(mirror);
        }
    } else {
        for loc in &c.drives {
            db.drives.set_use(*loc, DriveUse::RaidGroup(object_id));
        }
    }
    db.raid_groups.insert(
        object_id,
        RaidGroupRecord {
            object_id,
            raid_group_id: Some(c.raid_group_id),
            raid_type: c.raid_type,
            width,
            capacity: c.capacity,
            members: c.drives.clone(),
            downstream,
            parent: None,
            active_sp: sp,
        },
    );
    Ok(object_id)
}

fn destroy_raid_group(
    db: &mut SystemDb,
    object: ObjectId,
) -> Result<(), JobErrorCode> {
    let Some(rg) = db.raid_groups.get(&object) else {
        return Err(JobErrorCode::ObjectNotFound);
    };
    if rg.parent.is_some() || db.has_luns(object) {
        return Err(JobErrorCode::RequestObjectHasUpstreamEdges);
    }
    let mut doomed = rg.downstream.clone();
    doomed.push(object);
    for id in doomed {
        if let Some(r) = db.raid_groups.remove(&id) {
            for loc in r.members {
                db.drives.set_use(loc, DriveUse::Unbound);
            }
        }
    }
    Ok(())
}

fn create_lun(
    db: &mut SystemDb,
    raid_group: ObjectId,
    capacity: u64,
) -> Result<ObjectId, JobErrorCode> {
    let Some(rg) = db.raid_groups.get(&raid_group) else {
        return Err(JobErrorCode::ObjectNotFound);
    };
    let used: u64 = db
        .luns
        .values()
        .filter(|l| l.raid_group == raid_group)
        .map(|l| l.capacity)
        .sum();
    let exported = rg.capacity * rg.width as u64;
    if rg.parent.is_some() || capacity == 0 || used + capacity > exported {
        return Err(JobErrorCode::InvalidConfiguration);
    }
    let lun = db.alloc_object_id();
    db.luns.insert(
        lun,
        LunRecord {
            raid_group,
            capacity,
        },
    );
    Ok(lun)
}

fn configure_hot_spare(
    db: &mut SystemDb,
    location: DriveLocation,
) -> Result<(), JobErrorCode> {
    check_drive_free(db, location)?;
    db.drives.set_use(location, DriveUse::HotSpare);
    Ok(())
}

/// Permanently replace the drive at `position` with a configured hot spare
pub(crate) fn swap_in_spare(
    db: &mut SystemDb,
    object: ObjectId,
    position: Position,
    spare: DriveLocation,
) -> Result<(), JobErrorCode> {
    let Some(rg) = db.raid_groups.get(&object) else {
        return Err(JobErrorCode::ObjectNotFound);
    };
    if rg.is_striper() || !rg.raid_type.is_redundant() {
        return Err(JobErrorCode::SpareNotApplicable);
    }
    if position.get() >= rg.width {
        return Err(JobErrorCode::InvalidConfiguration);
    }
    let Some(d) = db.drives.get(spare) else {
        return Err(JobErrorCode::DriveNotFound);
    };
    match d.used_by {
        DriveUse::HotSpare if d.capacity >= rg.capacity => (),
        DriveUse::RaidGroup(_) => {
            return Err(JobErrorCode::PvdIsInUseForRaidGroup)
        }
        _ => return Err(JobErrorCode::SpareNotApplicable),
    }

    let old = rg.members[position.get()];
    let parent = rg.parent;
    db.drives.set_use(old, DriveUse::Unbound);
    db.drives.set_use(spare, DriveUse::RaidGroup(object));
    if let Some(rg) = db.raid_groups.get_mut(&object) {
        rg.members[position.get()] = spare;
    }
    // Keep the striper's flat member list in step with its mirror.
    if let Some(p) = parent.and_then(|p| db.raid_groups.get_mut(&p)) {
        if let Some(m) = p.members.iter_mut().find(|m| **m == old) {
            *m = spare;
        }
    }
    Ok(())
}

/// Convert an engine result into what `wait_for_job` hands back
pub(crate) fn to_job_result(
    r: Result<Option<ObjectId>, JobErrorCode>,
) -> JobResult {
    match r {
        Ok(object_id) => JobResult::success(object_id),
        Err(code) => JobResult::rejected(code),
    }
}
