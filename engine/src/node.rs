// Copyright 2023 Oxide Computer Company
use std::collections::BTreeMap;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sep_common::{
    sep_bail, JobNumber, LifecycleState, MetadataElementState, ObjectId,
    Position, SepError, SpId,
};
use slog::{debug, info, warn, Logger};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::background::{SchedulerConfig, DEFAULT_CHUNK_SIZE};
use crate::db::{lock_db, SystemDb};
use crate::job::{self, JobRequest, JobTable};
use crate::peer::{ForwardedOp, PeerLink, PeerMessage};
use crate::raid_group::RaidGroup;
use crate::{SepOp, SepRes};

/// Per-SP engine settings
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub monitor_interval: Duration,
    /// How often the Active SP pushes full object state to its peer
    pub update_peer_checkpoint_interval: Duration,
    /// Blocks per background-operation chunk
    pub chunk_size: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            monitor_interval: Duration::from_millis(100),
            update_peer_checkpoint_interval: Duration::from_secs(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), SepError> {
        if self.monitor_interval.is_zero() {
            sep_bail!(InvalidConfiguration, "monitor interval is zero");
        }
        if self.update_peer_checkpoint_interval.is_zero() {
            sep_bail!(InvalidConfiguration, "peer update interval is zero");
        }
        if self.chunk_size == 0 {
            sep_bail!(InvalidConfiguration, "chunk size is zero");
        }
        if self.scheduler.chunks_per_zero == 0 {
            sep_bail!(InvalidConfiguration, "chunks per zero is zero");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct NodeCounters {
    apply: u64,
    action_request: u64,
    action_peer: u64,
    action_monitor: u64,
    action_peer_sync: u64,
    action_peer_gone: u64,
    jobs_run: u64,
    snapshots_sent: u64,
}

/// Action to be taken which modifies the [`Node`] state
#[derive(Debug)]
pub(crate) enum NodeAction {
    Request(SepOp),
    Peer(PeerMessage),
    /// The peer's sending half went away
    PeerGone,
    Monitor,
    PeerSync,
    /// Every handle to this SP has been dropped
    Shutdown,
}

/// One SP: the sole owner of its objects' runtime state
pub(crate) struct Node {
    sp: SpId,
    cfg: NodeConfig,
    db: Arc<Mutex<SystemDb>>,
    objects: BTreeMap<ObjectId, RaidGroup>,
    jobs: JobTable,

    peer: Option<PeerLink>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerMessage>>,
    /// Link state seen at the last monitor cycle, to spot it coming back
    peer_was_alive: bool,

    req_rx: mpsc::Receiver<SepOp>,
    monitor_deadline: Instant,
    peer_deadline: Instant,

    counters: NodeCounters,
    log: Logger,
}

async fn recv_peer(
    rx: &mut Option<mpsc::UnboundedReceiver<PeerMessage>>,
) -> Option<PeerMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

impl Node {
    pub fn new(
        sp: SpId,
        cfg: NodeConfig,
        db: Arc<Mutex<SystemDb>>,
        link: Option<(PeerLink, mpsc::UnboundedReceiver<PeerMessage>)>,
        req_rx: mpsc::Receiver<SepOp>,
        log: Logger,
    ) -> Self {
        let now = Instant::now();
        let (peer, peer_rx) = match link {
            Some((p, rx)) => (Some(p), Some(rx)),
            None => (None, None),
        };
        let peer_was_alive = peer.as_ref().is_some_and(|p| p.is_alive());
        Node {
            sp,
            monitor_deadline: now + cfg.monitor_interval,
            peer_deadline: now + cfg.update_peer_checkpoint_interval,
            cfg,
            db,
            objects: BTreeMap::new(),
            jobs: JobTable::new(),
            peer,
            peer_rx,
            peer_was_alive,
            req_rx,
            counters: NodeCounters::default(),
            log,
        }
    }

    pub async fn run(mut self) {
        info!(self.log, "SP started");
        loop {
            let action = self.select().await;
            if let NodeAction::Shutdown = action {
                break;
            }
            self.apply(action);
        }
        info!(self.log, "SP exiting"; "counters" => ?self.counters);
    }

    /// Select an event from possible actions
    async fn select(&mut self) -> NodeAction {
        tokio::select! {
            op = self.req_rx.recv() => match op {
                Some(op) => NodeAction::Request(op),
                None => NodeAction::Shutdown,
            },
            m = recv_peer(&mut self.peer_rx) => match m {
                Some(m) => NodeAction::Peer(m),
                None => NodeAction::PeerGone,
            },
            _ = sleep_until(self.monitor_deadline) => {
                NodeAction::Monitor
            }
            _ = sleep_until(self.peer_deadline), if self.peer.is_some() => {
                NodeAction::PeerSync
            }
        }
    }

    /// Apply an action returned from [`Node::select`]
    pub(crate) fn apply(&mut self, action: NodeAction) {
        self.counters.apply += 1;
        match action {
            NodeAction::Request(op) => {
                self.counters.action_request += 1;
                self.on_request(op);
            }
            NodeAction::Peer(m) => {
                self.counters.action_peer += 1;
                self.on_peer_message(m);
            }
            NodeAction::PeerGone => {
                self.counters.action_peer_gone += 1;
                warn!(self.log, "peer SP is gone");
                self.peer_rx = None;
            }
            NodeAction::Monitor => {
                self.counters.action_monitor += 1;
                self.on_monitor();
                self.monitor_deadline =
                    Instant::now() + self.cfg.monitor_interval;
            }
            NodeAction::PeerSync => {
                self.counters.action_peer_sync += 1;
                self.send_snapshots();
                self.peer_deadline = Instant::now()
                    + self.cfg.update_peer_checkpoint_interval;
            }
            NodeAction::Shutdown => (),
        }
    }

    fn object(&self, object: ObjectId) -> Result<&RaidGroup, SepError> {
        match self.objects.get(&object) {
            Some(o) => Ok(o),
            None => sep_bail!(ObjectNotFound, object),
        }
    }

    fn submit_job(&mut self, req: JobRequest) -> Result<JobNumber, SepError> {
        let job = lock_db(&self.db).alloc_job();
        debug!(self.log, "job {} queued", job; "request" => ?req);
        self.jobs.submit(job, req);
        Ok(job)
    }

    fn on_request(&mut self, op: SepOp) {
        match op {
            SepOp::CreateRaidGroup { req, res } => {
                let _ = res
                    .send(self.submit_job(JobRequest::CreateRaidGroup(req)));
            }
            SepOp::DestroyRaidGroup { object, res } => {
                let _ = res.send(
                    self.submit_job(JobRequest::DestroyRaidGroup(object)),
                );
            }
            SepOp::CreateLun {
                raid_group,
                capacity,
                res,
            } => {
                let _ = res.send(self.submit_job(JobRequest::CreateLun {
                    raid_group,
                    capacity,
                }));
            }
            SepOp::DestroyLun { lun, res } => {
                let _ = res.send(self.submit_job(JobRequest::DestroyLun(lun)));
            }
            SepOp::ConfigureHotSpare { location, res } => {
                let _ = res.send(
                    self.submit_job(JobRequest::ConfigureHotSpare(location)),
                );
            }
            SepOp::SwapInSpare {
                object,
                position,
                spare,
                res,
            } => {
                let _ = res.send(self.submit_job(JobRequest::SwapInSpare {
                    object,
                    position,
                    spare,
                }));
            }
            SepOp::WaitForJob { job, res } => self.jobs.wait(job, res),

            SepOp::GetRaidGroupInfo { object, res } => {
                let _ = res.send(self.object(object).map(|o| o.info()));
            }
            SepOp::GetClusteredFlags { object, res } => {
                let _ = res.send(self.object(object).map(|o| o.flags()));
            }
            SepOp::GetMetadataElementState { object, res } => {
                let r = self.object(object).map(|o| {
                    if o.is_active() {
                        MetadataElementState::Active
                    } else {
                        MetadataElementState::Passive
                    }
                });
                let _ = res.send(r);
            }
            SepOp::GetDownstreamObjects { object, res } => {
                let _ = res.send(lock_db(&self.db).downstream(object));
            }
            SepOp::GetUpstreamObjects { object, res } => {
                let _ = res.send(lock_db(&self.db).upstream(object));
            }
            SepOp::LookupRaidGroup { raid_group_id, res } => {
                let r = lock_db(&self.db)
                    .lookup_raid_group(raid_group_id)
                    .ok_or(SepError::RaidGroupNumberNotFound(raid_group_id));
                let _ = res.send(r);
            }

            SepOp::Quiesce { object, res } => {
                self.active_or_forward(ForwardedOp::Quiesce(object), res)
            }
            SepOp::Unquiesce { object, res } => {
                self.active_or_forward(ForwardedOp::Unquiesce(object), res)
            }
            SepOp::InitiateVerify {
                object,
                verify_type,
                res,
            } => self.active_or_forward(
                ForwardedOp::InitiateVerify(object, verify_type),
                res,
            ),
            SepOp::InjectMediaError {
                object,
                position,
                lba,
                res,
            } => self.active_or_forward(
                ForwardedOp::InjectMediaError(object, position, lba),
                res,
            ),

            SepOp::SetChunksPerRebuild { chunks, res } => {
                let r = self.cfg.scheduler.set_chunks_per_rebuild(chunks);
                if r.is_ok() {
                    info!(self.log, "chunks per rebuild now {}", chunks);
                }
                let _ = res.send(r);
            }
            SepOp::SetUpdatePeerCheckpointInterval { interval, res } => {
                let r = if interval.is_zero() {
                    Err(SepError::InvalidArgument(
                        "peer update interval is zero".to_string(),
                    ))
                } else {
                    self.cfg.update_peer_checkpoint_interval = interval;
                    self.peer_deadline = Instant::now() + interval;
                    Ok(())
                };
                let _ = res.send(r);
            }
            SepOp::SetVerifyPriority { priority, res } => {
                info!(self.log, "verify priority now {:?}", priority);
                self.cfg.scheduler.verify_priority = priority;
                let _ = res.send(Ok(()));
            }
            SepOp::GetPersistedSepVersion { res } => {
                let _ = res.send(Ok(lock_db(&self.db).persisted_sep_version()));
            }
            SepOp::SetPersistedSepVersion { version, res } => {
                lock_db(&self.db).set_persisted_sep_version(version);
                let _ = res.send(Ok(()));
            }
        }
    }

    /// Run `op` here if we own the object, otherwise hand it to the peer
    fn active_or_forward(&mut self, op: ForwardedOp, res: SepRes<()>) {
        let active = match self.object(op.object()) {
            Ok(o) => o.is_active(),
            Err(e) => {
                let _ = res.send(Err(e));
                return;
            }
        };
        let r = if active {
            self.apply_forwarded(op)
        } else {
            match &self.peer {
                Some(peer) if peer.send(PeerMessage::Forward(op)) => {
                    debug!(self.log, "forwarded {:?} to peer", op);
                    Ok(())
                }
                _ => Err(SepError::PeerNotAlive),
            }
        };
        let _ = res.send(r);
    }

    fn apply_forwarded(&mut self, op: ForwardedOp) -> Result<(), SepError> {
        let object = op.object();
        let Some(obj) = self.objects.get_mut(&object) else {
            sep_bail!(ObjectNotFound, object);
        };
        if !obj.is_active() {
            warn!(self.log, "{:?} for an object we do not own", op);
            sep_bail!(PeerNotAlive);
        }
        match op {
            ForwardedOp::Quiesce(_) => {
                if obj.request_quiesce() {
                    self.push_flags(object);
                }
            }
            ForwardedOp::Unquiesce(_) => {
                if obj.request_unquiesce() {
                    self.push_flags(object);
                }
            }
            ForwardedOp::InitiateVerify(_, vt) => {
                // A RAID10 verifies through its mirrors.
                let targets = if obj.is_striper() {
                    obj.downstream.clone()
                } else {
                    vec![object]
                };
                for t in targets {
                    if let Some(o) = self.objects.get_mut(&t) {
                        info!(self.log, "{} verify requested on {}", vt, t);
                        o.queue_verify(vt);
                    }
                }
            }
            ForwardedOp::InjectMediaError(_, position, lba) => {
                let (target, position) = if obj.is_striper() {
                    let mirror = obj
                        .downstream
                        .get(position.get() / 2)
                        .copied()
                        .ok_or(SepError::InvalidPosition(position))?;
                    (mirror, Position::new(position.get() % 2))
                } else {
                    (object, position)
                };
                match self.objects.get_mut(&target) {
                    Some(o) => o.inject_media_error(position, lba)?,
                    None => sep_bail!(ObjectNotFound, target),
                }
            }
        }
        Ok(())
    }

    fn push_flags(&self, object: ObjectId) {
        if let (Some(peer), Some(obj)) = (&self.peer, self.objects.get(&object))
        {
            peer.send(PeerMessage::ClusteredFlags {
                object,
                flags: obj.flags(),
            });
        }
    }

    fn send_peer(&self, m: PeerMessage) {
        if let Some(peer) = &self.peer {
            peer.send(m);
        }
    }

    /// Push the full state of everything we own
    fn send_snapshots(&mut self) {
        let Some(peer) = &self.peer else {
            return;
        };
        for o in self.objects.values().filter(|o| o.is_active()) {
            if peer.send(PeerMessage::Checkpoint(Box::new(o.info()))) {
                self.counters.snapshots_sent += 1;
            }
        }
    }

    fn on_peer_message(&mut self, m: PeerMessage) {
        if !self.peer.as_ref().is_some_and(|p| p.is_alive()) {
            debug!(self.log, "link down, dropping {:?}", m);
            return;
        }
        match m {
            PeerMessage::ResyncRequest => {
                info!(self.log, "peer asked for resync");
                self.reconcile();
                self.send_peer(PeerMessage::ConfigChanged);
                self.send_snapshots();
            }
            PeerMessage::ConfigChanged => self.reconcile(),
            PeerMessage::Checkpoint(info) => {
                if !self.objects.contains_key(&info.object_id) {
                    self.reconcile();
                }
                match self.objects.get_mut(&info.object_id) {
                    Some(o) => o.apply_snapshot(&info),
                    None => {
                        debug!(
                            self.log,
                            "snapshot for unknown {}", info.object_id
                        )
                    }
                }
            }
            PeerMessage::ClusteredFlags { object, flags } => {
                if let Some(o) = self.objects.get_mut(&object) {
                    o.set_peer_flags(flags);
                }
            }
            PeerMessage::Forward(op) => {
                if let Err(e) = self.apply_forwarded(op) {
                    warn!(self.log, "forwarded {:?} failed: {}", op, e);
                }
            }
        }
    }

    /// Bring the object map in line with the system database
    fn reconcile(&mut self) {
        let db = lock_db(&self.db);
        let gone: Vec<ObjectId> = self
            .objects
            .keys()
            .filter(|id| !db.raid_groups.contains_key(id))
            .copied()
            .collect();
        for id in gone {
            info!(self.log, "object {} destroyed", id);
            self.objects.remove(&id);
        }
        for (id, rec) in &db.raid_groups {
            match self.objects.get_mut(id) {
                Some(o) => o.sync_members(&rec.members),
                None => {
                    let state = if rec.active_sp == self.sp {
                        MetadataElementState::Active
                    } else {
                        MetadataElementState::Passive
                    };
                    info!(self.log, "object {} is {:?} here", id, state);
                    self.objects.insert(
                        *id,
                        RaidGroup::new(
                            rec,
                            state,
                            self.cfg.chunk_size,
                            &self.log,
                        ),
                    );
                }
            }
        }
    }

    /// Returns true if any job changed the database
    fn run_jobs(&mut self) -> bool {
        let mut changed = false;
        for (job, req) in self.jobs.take_queued() {
            let r = job::execute(&mut lock_db(&self.db), self.sp, &req);
            match &r {
                Ok(created) => {
                    changed = true;
                    info!(self.log, "job {} done", job; "created" => ?created);
                }
                Err(code) => {
                    warn!(self.log, "job {} refused: {:?}", job, code)
                }
            }
            self.counters.jobs_run += 1;
            self.jobs.complete(job, job::to_job_result(r));
        }
        changed
    }

    /// Notice the link going down or coming back
    ///
    /// On the way up we ask the peer to resync and send it everything we
    /// own, since neither side kept what the other missed.
    fn check_peer_link(&mut self) {
        let Some(peer) = &self.peer else {
            return;
        };
        let alive = peer.is_alive();
        let came_up = alive && !self.peer_was_alive;
        if came_up {
            info!(self.log, "peer link up, asking for resync");
            peer.send(PeerMessage::ResyncRequest);
        } else if !alive && self.peer_was_alive {
            warn!(self.log, "peer link down");
        }
        self.peer_was_alive = alive;
        if came_up {
            self.send_snapshots();
        }
    }

    fn on_monitor(&mut self) {
        let now = Instant::now();

        if self.run_jobs() {
            self.reconcile();
            self.send_peer(PeerMessage::ConfigChanged);
        }

        let mut flag_changes = Vec::new();
        let mut config_changed = false;
        {
            let mut db = lock_db(&self.db);
            for (id, o) in self.objects.iter_mut() {
                if !o.is_active() || o.is_striper() {
                    continue;
                }
                let out = o.monitor(&mut db, now, &self.cfg.scheduler);
                if out.flags_changed {
                    flag_changes.push(*id);
                }
                config_changed |= out.config_changed;
            }
        }

        let stripers: Vec<(ObjectId, bool)> = self
            .objects
            .values()
            .filter(|o| o.is_active() && o.is_striper())
            .map(|s| {
                let failed = s.downstream.iter().any(|m| {
                    self.objects
                        .get(m)
                        .is_some_and(|m| m.lifecycle() == LifecycleState::Fail)
                });
                (s.id, failed)
            })
            .collect();
        for (id, failed) in stripers {
            if let Some(s) = self.objects.get_mut(&id) {
                if s.set_striper_lifecycle(failed) {
                    flag_changes.push(id);
                }
            }
        }

        if config_changed {
            self.reconcile();
            self.send_peer(PeerMessage::ConfigChanged);
        }
        for id in flag_changes {
            self.push_flags(id);
        }
        self.check_peer_link();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::RaidGroupCreate;
    use crate::peer::link_pair;
    use slog::o;
    use sep_common::{
        build_logger, ClusteredFlags, DriveLocation, JobErrorCode, Lba,
        RaidGroupInfo, RaidType, VerifyType,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    fn db() -> Arc<Mutex<SystemDb>> {
        let mut db = SystemDb::default();
        for s in 0..8 {
            db.drives.insert_new(DriveLocation::new(0, 0, s), 0x20000).unwrap();
        }
        Arc::new(Mutex::new(db))
    }

    fn node(
        sp: SpId,
        db: Arc<Mutex<SystemDb>>,
        link: Option<(PeerLink, mpsc::UnboundedReceiver<PeerMessage>)>,
    ) -> Node {
        let (_tx, rx) = mpsc::channel(1);
        let log = build_logger().new(o!("sp" => sp.to_string()));
        Node::new(sp, NodeConfig::default(), db, link, rx, log)
    }

    /// Run a request through `apply` and hand back the reply
    fn request<T>(
        n: &mut Node,
        op: impl FnOnce(SepRes<T>) -> SepOp,
    ) -> Result<T, SepError> {
        let (tx, mut rx) = oneshot::channel();
        n.apply(NodeAction::Request(op(tx)));
        rx.try_recv().unwrap()
    }

    fn info_of(n: &mut Node, object: ObjectId) -> RaidGroupInfo {
        request(n, |res| SepOp::GetRaidGroupInfo { object, res }).unwrap()
    }

    fn create_raid5(n: &mut Node) -> ObjectId {
        let req = RaidGroupCreate {
            raid_group_id: 5,
            raid_type: RaidType::Raid5,
            drives: (0..5).map(|s| DriveLocation::new(0, 0, s)).collect(),
            capacity: 0x10000,
        };
        let job =
            request(n, |res| SepOp::CreateRaidGroup { req, res }).unwrap();
        let (tx, mut rx) = oneshot::channel();
        n.apply(NodeAction::Request(SepOp::WaitForJob { job, res: tx }));
        assert!(rx.try_recv().is_err());
        n.apply(NodeAction::Monitor);
        let r = rx.try_recv().unwrap().unwrap();
        assert!(r.is_success());
        r.object_id.unwrap()
    }

    /// Deliver everything `from` sent over the link to `to`
    fn deliver(
        rx: &mut mpsc::UnboundedReceiver<PeerMessage>,
        to: &mut Node,
    ) -> usize {
        let mut n = 0;
        while let Ok(m) = rx.try_recv() {
            to.apply(NodeAction::Peer(m));
            n += 1;
        }
        n
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_on_monitor_cycle() {
        let mut a = node(SpId::A, db(), None);
        let rg = create_raid5(&mut a);
        let info =
            request(&mut a, |res| SepOp::GetRaidGroupInfo { object: rg, res })
                .unwrap();
        assert_eq!(info.metadata_element_state, MetadataElementState::Active);
        assert_eq!(
            request(&mut a, |res| SepOp::LookupRaidGroup {
                raid_group_id: 5,
                res
            }),
            Ok(rg)
        );
        assert_eq!(
            request(&mut a, |res| SepOp::LookupRaidGroup {
                raid_group_id: 6,
                res
            }),
            Err(SepError::RaidGroupNumberNotFound(6))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_refused_with_luns() {
        let mut a = node(SpId::A, db(), None);
        let rg = create_raid5(&mut a);
        request(&mut a, |res| SepOp::CreateLun {
            raid_group: rg,
            capacity: 0x1000,
            res,
        })
        .unwrap();
        let job = request(&mut a, |res| SepOp::DestroyRaidGroup {
            object: rg,
            res,
        })
        .unwrap();
        a.apply(NodeAction::Monitor);
        let r = request(&mut a, |res| SepOp::WaitForJob { job, res }).unwrap();
        assert_eq!(r.error_code, JobErrorCode::RequestObjectHasUpstreamEdges);
        assert!(a.objects.contains_key(&rg));
    }

    #[tokio::test(start_paused = true)]
    async fn quiesce_is_honoured_next_cycle() {
        let mut a = node(SpId::A, db(), None);
        let rg = create_raid5(&mut a);
        request(&mut a, |res| SepOp::Quiesce { object: rg, res }).unwrap();
        let flags =
            request(&mut a, |res| SepOp::GetClusteredFlags { object: rg, res })
                .unwrap();
        assert!(flags.contains(ClusteredFlags::QUIESCING));
        a.apply(NodeAction::Monitor);
        let flags =
            request(&mut a, |res| SepOp::GetClusteredFlags { object: rg, res })
                .unwrap();
        assert!(flags.contains(ClusteredFlags::QUIESCED));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_tuning_is_rejected() {
        let mut a = node(SpId::A, db(), None);
        assert!(matches!(
            request(&mut a, |res| SepOp::SetChunksPerRebuild {
                chunks: 11,
                res
            }),
            Err(SepError::InvalidArgument(_))
        ));
        assert!(request(&mut a, |res| SepOp::SetUpdatePeerCheckpointInterval {
            interval: Duration::ZERO,
            res
        })
        .is_err());
        request(&mut a, |res| SepOp::SetPersistedSepVersion { version: 9, res })
            .unwrap();
        assert_eq!(
            request(&mut a, |res| SepOp::GetPersistedSepVersion { res }),
            Ok(9)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn passive_side_follows_active() {
        let db = db();
        let alive = Arc::new(AtomicBool::new(true));
        let (la, lb) = link_pair(alive.clone());
        let (la, mut a_rx) = la;
        let (lb, mut b_rx) = lb;
        // Messages are pumped by hand with `deliver`, so each node gets a
        // receiver nothing ever sends on.
        let mut a = node(SpId::A, db.clone(), Some((la, idle_rx())));
        let mut b = node(SpId::B, db, Some((lb, idle_rx())));

        let rg = create_raid5(&mut a);
        // ConfigChanged tells B about the new object.
        assert!(deliver(&mut b_rx, &mut b) > 0);
        let state = request(&mut b, |res| SepOp::GetMetadataElementState {
            object: rg,
            res,
        })
        .unwrap();
        assert_eq!(state, MetadataElementState::Passive);

        // Quiesce through the passive side is forwarded.
        request(&mut b, |res| SepOp::Quiesce { object: rg, res }).unwrap();
        deliver(&mut a_rx, &mut a);
        a.apply(NodeAction::Monitor);
        deliver(&mut b_rx, &mut b);
        let flags =
            request(&mut b, |res| SepOp::GetClusteredFlags { object: rg, res })
                .unwrap();
        assert!(flags.contains(ClusteredFlags::QUIESCED));

        // Checkpoints arrive with the periodic snapshot.
        request(&mut a, |res| SepOp::Unquiesce { object: rg, res }).unwrap();
        request(&mut a, |res| SepOp::InitiateVerify {
            object: rg,
            verify_type: VerifyType::ReadWrite,
            res,
        })
        .unwrap();
        a.apply(NodeAction::Monitor);
        a.apply(NodeAction::PeerSync);
        deliver(&mut b_rx, &mut b);
        let ai = info_of(&mut a, rg);
        let bi = info_of(&mut b, rg);
        assert!(bi.rw_verify_checkpoint.is_some());
        assert_eq!(ai.rw_verify_checkpoint, bi.rw_verify_checkpoint);
        assert_eq!(
            ai.base_config_clustered_flags,
            bi.base_config_clustered_flags
        );

        // With the link down, forwarding fails and nothing is sent.
        alive.store(false, Ordering::Release);
        assert_eq!(
            request(&mut b, |res| SepOp::InjectMediaError {
                object: rg,
                position: Position(0),
                lba: Lba(0),
                res
            }),
            Err(SepError::PeerNotAlive)
        );
        a.apply(NodeAction::Monitor);
        a.apply(NodeAction::PeerSync);
        assert!(b_rx.try_recv().is_err());

        // Link back up: A notices on its next cycle and both resync.
        alive.store(true, Ordering::Release);
        a.apply(NodeAction::Monitor);
        deliver(&mut b_rx, &mut b);
        deliver(&mut a_rx, &mut a);
        deliver(&mut b_rx, &mut b);
        let ai = info_of(&mut a, rg);
        let bi = info_of(&mut b, rg);
        assert_eq!(ai.rw_verify_checkpoint, bi.rw_verify_checkpoint);
    }

    fn idle_rx() -> mpsc::UnboundedReceiver<PeerMessage> {
        mpsc::unbounded_channel().1
    }
}
