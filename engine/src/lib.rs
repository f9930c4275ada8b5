// Copyright 2023 Oxide Computer Company
//! A simulated dual-SP storage extent package
//!
//! Each SP runs as a single tokio task that owns every raid group object
//! it knows about.  Callers talk to an SP through a [`SepHandle`], which
//! sends a [`SepOp`] down a channel and waits on a oneshot for the reply.
//! The [`Array`] starts the SPs and stands in for the hardware: it pulls,
//! reinserts and glitches drives, and can cut the link between the SPs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sep_common::{
    sep_bail, ClusteredFlags, DriveLocation, JobNumber, JobResult, Lba,
    MetadataElementState, ObjectId, Position, RaidGroupInfo, SepError, SpId,
    VerifyType,
};
use slog::{info, o, warn, Logger};
use strum::IntoEnumIterator;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

mod background;
mod db;
mod drive;
mod job;
mod node;
mod peer;
mod quiesce;
mod raid_group;

pub use background::{
    SchedulerConfig, VerifyPriority, DEFAULT_CHUNK_SIZE,
    MAX_CHUNKS_PER_REBUILD,
};
pub use drive::DriveHandle;
pub use job::RaidGroupCreate;
pub use node::NodeConfig;

use db::{lock_db, SystemDb};
use node::Node;
use peer::link_pair;

pub(crate) type SepRes<T> = oneshot::Sender<Result<T, SepError>>;

/// Requests an SP task services, each carrying its reply channel
#[derive(Debug)]
pub(crate) enum SepOp {
    CreateRaidGroup {
        req: RaidGroupCreate,
        res: SepRes<JobNumber>,
    },
    DestroyRaidGroup {
        object: ObjectId,
        res: SepRes<JobNumber>,
    },
    CreateLun {
        raid_group: ObjectId,
        capacity: u64,
        res: SepRes<JobNumber>,
    },
    DestroyLun {
        lun: ObjectId,
        res: SepRes<JobNumber>,
    },
    ConfigureHotSpare {
        location: DriveLocation,
        res: SepRes<JobNumber>,
    },
    SwapInSpare {
        object: ObjectId,
        position: Position,
        spare: DriveLocation,
        res: SepRes<JobNumber>,
    },
    WaitForJob {
        job: JobNumber,
        res: SepRes<JobResult>,
    },

    // Queries
    GetRaidGroupInfo {
        object: ObjectId,
        res: SepRes<RaidGroupInfo>,
    },
    GetClusteredFlags {
        object: ObjectId,
        res: SepRes<ClusteredFlags>,
    },
    GetMetadataElementState {
        object: ObjectId,
        res: SepRes<MetadataElementState>,
    },
    GetDownstreamObjects {
        object: ObjectId,
        res: SepRes<Vec<ObjectId>>,
    },
    GetUpstreamObjects {
        object: ObjectId,
        res: SepRes<Vec<ObjectId>>,
    },
    LookupRaidGroup {
        raid_group_id: u32,
        res: SepRes<ObjectId>,
    },

    // Requests that only the Active SP acts on
    Quiesce {
        object: ObjectId,
        res: SepRes<()>,
    },
    Unquiesce {
        object: ObjectId,
        res: SepRes<()>,
    },
    InitiateVerify {
        object: ObjectId,
        verify_type: VerifyType,
        res: SepRes<()>,
    },
    InjectMediaError {
        object: ObjectId,
        position: Position,
        lba: Lba,
        res: SepRes<()>,
    },

    // Tuning
    SetChunksPerRebuild {
        chunks: u32,
        res: SepRes<()>,
    },
    SetUpdatePeerCheckpointInterval {
        interval: Duration,
        res: SepRes<()>,
    },
    SetVerifyPriority {
        priority: VerifyPriority,
        res: SepRes<()>,
    },
    GetPersistedSepVersion {
        res: SepRes<u64>,
    },
    SetPersistedSepVersion {
        version: u64,
        res: SepRes<()>,
    },
}

/// Client side of one SP
#[derive(Clone, Debug)]
pub struct SepHandle {
    sp: SpId,
    req_tx: mpsc::Sender<SepOp>,
    log: Logger,
}

impl SepHandle {
    pub fn sp(&self) -> SpId {
        self.sp
    }

    async fn call<T>(
        &self,
        op: impl FnOnce(SepRes<T>) -> SepOp,
    ) -> Result<T, SepError> {
        let (res, rx) = oneshot::channel();
        if let Err(e) = self.req_tx.send(op(res)).await {
            // The reply sender went down with the op, so the wait below
            // turns this into RecvDisconnected.
            warn!(self.log, "failed to send op to {}: {e}", self.sp);
        }
        rx.await.unwrap_or(Err(SepError::RecvDisconnected))
    }

    pub async fn create_raid_group(
        &self,
        req: RaidGroupCreate,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::CreateRaidGroup { req, res }).await
    }

    pub async fn destroy_raid_group(
        &self,
        object: ObjectId,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::DestroyRaidGroup { object, res }).await
    }

    pub async fn create_lun(
        &self,
        raid_group: ObjectId,
        capacity: u64,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::CreateLun {
            raid_group,
            capacity,
            res,
        })
        .await
    }

    pub async fn destroy_lun(
        &self,
        lun: ObjectId,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::DestroyLun { lun, res }).await
    }

    pub async fn configure_hot_spare(
        &self,
        location: DriveLocation,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::ConfigureHotSpare { location, res })
            .await
    }

    pub async fn swap_in_spare(
        &self,
        object: ObjectId,
        position: Position,
        spare: DriveLocation,
    ) -> Result<JobNumber, SepError> {
        self.call(|res| SepOp::SwapInSpare {
            object,
            position,
            spare,
            res,
        })
        .await
    }

    /// Wait for a job submitted to this SP to finish
    ///
    /// This parks until the job runs; callers supply their own timeout.
    pub async fn wait_for_job(
        &self,
        job: JobNumber,
    ) -> Result<JobResult, SepError> {
        self.call(|res| SepOp::WaitForJob { job, res }).await
    }

    pub async fn get_raid_group_info(
        &self,
        object: ObjectId,
    ) -> Result<RaidGroupInfo, SepError> {
        self.call(|res| SepOp::GetRaidGroupInfo { object, res }).await
    }

    pub async fn get_clustered_flags(
        &self,
        object: ObjectId,
    ) -> Result<ClusteredFlags, SepError> {
        self.call(|res| SepOp::GetClusteredFlags { object, res }).await
    }

    pub async fn get_metadata_element_state(
        &self,
        object: ObjectId,
    ) -> Result<MetadataElementState, SepError> {
        self.call(|res| SepOp::GetMetadataElementState { object, res })
            .await
    }

    pub async fn get_downstream_objects(
        &self,
        object: ObjectId,
    ) -> Result<Vec<ObjectId>, SepError> {
        self.call(|res| SepOp::GetDownstreamObjects { object, res })
            .await
    }

    pub async fn get_upstream_objects(
        &self,
        object: ObjectId,
    ) -> Result<Vec<ObjectId>, SepError> {
        self.call(|res| SepOp::GetUpstreamObjects { object, res })
            .await
    }

    pub async fn lookup_raid_group(
        &self,
        raid_group_id: u32,
    ) -> Result<ObjectId, SepError> {
        self.call(|res| SepOp::LookupRaidGroup { raid_group_id, res })
            .await
    }

    /// Ask for a quiesce; the flag shows up some time later
    pub async fn quiesce(&self, object: ObjectId) -> Result<(), SepError> {
        self.call(|res| SepOp::Quiesce { object, res }).await
    }

    pub async fn unquiesce(&self, object: ObjectId) -> Result<(), SepError> {
        self.call(|res| SepOp::Unquiesce { object, res }).await
    }

    pub async fn initiate_verify(
        &self,
        object: ObjectId,
        verify_type: VerifyType,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::InitiateVerify {
            object,
            verify_type,
            res,
        })
        .await
    }

    pub async fn inject_media_error(
        &self,
        object: ObjectId,
        position: Position,
        lba: Lba,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::InjectMediaError {
            object,
            position,
            lba,
            res,
        })
        .await
    }

    pub async fn set_chunks_per_rebuild(
        &self,
        chunks: u32,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::SetChunksPerRebuild { chunks, res })
            .await
    }

    pub async fn set_update_peer_checkpoint_interval(
        &self,
        interval: Duration,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::SetUpdatePeerCheckpointInterval {
            interval,
            res,
        })
        .await
    }

    pub async fn set_verify_priority(
        &self,
        priority: VerifyPriority,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::SetVerifyPriority { priority, res })
            .await
    }

    pub async fn get_persisted_sep_version(&self) -> Result<u64, SepError> {
        self.call(|res| SepOp::GetPersistedSepVersion { res }).await
    }

    pub async fn set_persisted_sep_version(
        &self,
        version: u64,
    ) -> Result<(), SepError> {
        self.call(|res| SepOp::SetPersistedSepVersion { version, res })
            .await
    }
}

/// Drive slots populated when the array starts
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DriveLayout {
    pub buses: u32,
    pub enclosures: u32,
    pub slots: u32,
    /// Blocks per drive
    pub capacity: u64,
}

impl Default for DriveLayout {
    fn default() -> Self {
        DriveLayout {
            buses: 1,
            enclosures: 2,
            slots: 15,
            capacity: 0x20000,
        }
    }
}

impl DriveLayout {
    pub fn locations(&self) -> impl Iterator<Item = DriveLocation> + '_ {
        (0..self.buses).flat_map(move |b| {
            (0..self.enclosures).flat_map(move |e| {
                (0..self.slots).map(move |s| DriveLocation::new(b, e, s))
            })
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct ArrayConfig {
    pub dualsp: bool,
    pub node: NodeConfig,
    pub drives: DriveLayout,
}

/// Both SPs plus the simulated hardware under them
pub struct Array {
    id: Uuid,
    db: Arc<Mutex<SystemDb>>,
    link_alive: Arc<AtomicBool>,
    handles: Vec<SepHandle>,
    tasks: Vec<JoinHandle<()>>,
    log: Logger,
}

impl Array {
    /// Start the SP tasks; must be called from inside a tokio runtime
    pub fn start(cfg: ArrayConfig, log: &Logger) -> Result<Array, SepError> {
        cfg.node.validate()?;
        let id = Uuid::new_v4();
        let log = log.new(o!("array" => id.to_string()));

        let mut db = SystemDb::default();
        for loc in cfg.drives.locations() {
            db.drives.insert_new(loc, cfg.drives.capacity)?;
        }
        let db = Arc::new(Mutex::new(db));

        let link_alive = Arc::new(AtomicBool::new(cfg.dualsp));
        let links = if cfg.dualsp {
            let (a, b) = link_pair(link_alive.clone());
            vec![Some(a), Some(b)]
        } else {
            vec![None]
        };

        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        for (sp, link) in SpId::iter().zip(links) {
            // Every sender waits for its reply, so the queue stays short.
            let (req_tx, req_rx) = mpsc::channel(500);
            let node_log = log.new(o!("sp" => sp.to_string()));
            let node = Node::new(
                sp,
                cfg.node.clone(),
                db.clone(),
                link,
                req_rx,
                node_log.clone(),
            );
            tasks.push(tokio::spawn(node.run()));
            handles.push(SepHandle {
                sp,
                req_tx,
                log: node_log,
            });
        }
        info!(
            log,
            "array started";
            "dualsp" => cfg.dualsp,
            "drives" => cfg.drives.locations().count()
        );

        Ok(Array {
            id,
            db,
            link_alive,
            handles,
            tasks,
            log,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_dualsp(&self) -> bool {
        self.handles.len() > 1
    }

    /// The SP tests talk to by default
    pub fn local(&self) -> SepHandle {
        self.handles[0].clone()
    }

    pub fn handle(&self, sp: SpId) -> Option<SepHandle> {
        self.handles.iter().find(|h| h.sp == sp).cloned()
    }

    pub fn drive_locations(&self) -> Vec<DriveLocation> {
        lock_db(&self.db).drives.locations()
    }

    pub fn pull_drive(
        &self,
        location: DriveLocation,
    ) -> Result<DriveHandle, SepError> {
        let h = lock_db(&self.db).drives.pull(location)?;
        info!(self.log, "pulled drive {}", location);
        Ok(h)
    }

    pub fn reinsert_drive(
        &self,
        location: DriveLocation,
        handle: DriveHandle,
    ) -> Result<(), SepError> {
        lock_db(&self.db).drives.reinsert(location, handle)?;
        info!(self.log, "reinserted drive {}", location);
        Ok(())
    }

    /// Make a drive drop out for `duration` and then come back by itself
    pub fn glitch_drive(
        &self,
        location: DriveLocation,
        duration: Duration,
    ) -> Result<(), SepError> {
        let now = tokio::time::Instant::now();
        lock_db(&self.db).drives.glitch(location, duration, now)?;
        info!(self.log, "glitching drive {} for {:?}", location, duration);
        Ok(())
    }

    /// Put a brand new drive into an empty (or pulled) slot
    pub fn insert_new_drive(
        &self,
        location: DriveLocation,
        capacity: u64,
    ) -> Result<(), SepError> {
        lock_db(&self.db).drives.insert_new(location, capacity)?;
        info!(self.log, "new drive in {}", location; "capacity" => capacity);
        Ok(())
    }

    pub fn set_peer_alive(&self, alive: bool) -> Result<(), SepError> {
        if !self.is_dualsp() {
            sep_bail!(InvalidConfiguration, "array runs a single SP");
        }
        self.link_alive.store(alive, Ordering::Release);
        info!(self.log, "peer link {}", if alive { "up" } else { "down" });
        Ok(())
    }

    pub fn peer_alive(&self) -> bool {
        self.link_alive.load(Ordering::Acquire)
    }

    /// Drop our handles and wait for the SP tasks to exit
    ///
    /// Tasks only exit once every [`SepHandle`] clone is gone.
    pub async fn shutdown(self) {
        let Array {
            handles, tasks, log, ..
        } = self;
        drop(handles);
        for t in tasks {
            if let Err(e) = t.await {
                warn!(log, "SP task failed: {e}");
            }
        }
    }
}
