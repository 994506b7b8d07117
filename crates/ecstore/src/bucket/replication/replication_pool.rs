// Copyright 2024 GarnetFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bounded replication worker pool. Incoming writes and deletes are
//! hashed onto regular workers, large objects get their own worker set,
//! and heal/existing-object traffic drains through the MRF workers.
//! Enqueues never block live traffic: a full queue drops to the MRF save
//! channel and the scanner picks the item up on its next pass.

use crate::bucket::replication::replicate::{
    DeletedObjectReplicationInfo, ReplicateObjectInfo, replicate_delete, replicate_object,
};
use crate::bucket::replication::replication_resyncer::ReplicationResyncer;
use crate::bucket::replication::replication_stats::{ReplicationStats, set_global_replication_stats};
use crate::store_api::{ObjectInfo, StorageAPI};
use garnetfs_filemeta::{
    MrfReplicateEntry, ReplicateDecision, ReplicationStatusType, ReplicationType, ReplicationWorkerOperation, ResyncDecision,
    replication_statuses_map, version_purge_statuses_map,
};
use garnetfs_utils::http::RESERVED_METADATA_PREFIX_LOWER;
use garnetfs_utils::{DEFAULT_SIP_HASH_KEY, sip_hash};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{info, warn};

pub const WORKER_MAX_LIMIT: usize = 500;
pub const WORKER_MIN_LIMIT: usize = 50;
pub const WORKER_AUTO_DEFAULT: usize = 100;
pub const MRF_WORKER_MAX_LIMIT: usize = 8;
pub const MRF_WORKER_MIN_LIMIT: usize = 2;
pub const MRF_WORKER_AUTO_DEFAULT: usize = 4;
pub const LARGE_WORKER_COUNT: usize = 10;
pub const MIN_LARGE_OBJ_SIZE: i64 = 128 * 1024 * 1024; // 128MiB

/// Capacity of each replication queue.
pub const REPLICATION_QUEUE_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPriority {
    Fast,
    Slow,
    Auto,
}

impl ReplicationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationPriority::Fast => "fast",
            ReplicationPriority::Slow => "slow",
            ReplicationPriority::Auto => "auto",
        }
    }
}

impl From<&str> for ReplicationPriority {
    fn from(s: &str) -> Self {
        match s {
            "fast" => ReplicationPriority::Fast,
            "slow" => ReplicationPriority::Slow,
            _ => ReplicationPriority::Auto,
        }
    }
}

/// Work item flowing through the pool's queues.
#[derive(Debug)]
pub enum ReplicationOperation {
    Object(Box<ReplicateObjectInfo>),
    Delete(Box<DeletedObjectReplicationInfo>),
}

impl ReplicationOperation {
    fn to_mrf_entry(&self) -> MrfReplicateEntry {
        match self {
            ReplicationOperation::Object(obj) => obj.to_mrf_entry(),
            ReplicationOperation::Delete(del) => del.to_mrf_entry(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationPoolOpts {
    pub priority: ReplicationPriority,
    pub max_workers: Option<usize>,
    pub max_l_workers: Option<usize>,
}

impl Default for ReplicationPoolOpts {
    fn default() -> Self {
        Self {
            priority: ReplicationPriority::Auto,
            max_workers: None,
            max_l_workers: None,
        }
    }
}

#[derive(Debug)]
pub struct ReplicationPool<S: StorageAPI> {
    active_workers: Arc<AtomicI32>,
    active_lrg_workers: Arc<AtomicI32>,
    active_mrf_workers: Arc<AtomicI32>,

    storage: Arc<S>,

    priority: RwLock<ReplicationPriority>,
    max_workers: RwLock<usize>,
    max_l_workers: RwLock<usize>,

    stats: Arc<ReplicationStats>,

    // Regular and large-object worker channels; workers also drain the
    // delete queue items routed onto them.
    workers: RwLock<Vec<Sender<ReplicationOperation>>>,
    lrg_workers: RwLock<Vec<Sender<ReplicationOperation>>>,

    // MRF: one shared queue drained by its own worker set.
    mrf_replica_tx: Sender<ReplicationOperation>,
    mrf_replica_rx: Arc<Mutex<Receiver<ReplicationOperation>>>,
    mrf_save_tx: Sender<MrfReplicateEntry>,
    mrf_save_rx: Mutex<Option<Receiver<MrfReplicateEntry>>>,
    mrf_worker_kill_tx: tokio::sync::broadcast::Sender<()>,
    mrf_worker_size: AtomicI32,

    // "Unable to keep up" is logged once per saturation episode.
    backlogged: AtomicBool,

    resyncer: Arc<ReplicationResyncer>,
}

impl<S: StorageAPI> ReplicationPool<S> {
    pub async fn new(opts: ReplicationPoolOpts, stats: Arc<ReplicationStats>, storage: Arc<S>) -> Arc<Self> {
        let max_workers = opts.max_workers.unwrap_or(WORKER_MAX_LIMIT);

        let (workers, failed_workers) = match opts.priority {
            ReplicationPriority::Fast => (WORKER_MAX_LIMIT, MRF_WORKER_MAX_LIMIT),
            ReplicationPriority::Slow => (WORKER_MIN_LIMIT, MRF_WORKER_MIN_LIMIT),
            ReplicationPriority::Auto => (WORKER_AUTO_DEFAULT, MRF_WORKER_AUTO_DEFAULT),
        };

        let workers = workers.min(max_workers);
        let failed_workers = failed_workers.min(max_workers);
        let max_l_workers = opts.max_l_workers.unwrap_or(LARGE_WORKER_COUNT);

        let (mrf_replica_tx, mrf_replica_rx) = channel(REPLICATION_QUEUE_CAPACITY);
        let (mrf_save_tx, mrf_save_rx) = channel(REPLICATION_QUEUE_CAPACITY);
        let (mrf_worker_kill_tx, _) = tokio::sync::broadcast::channel(MRF_WORKER_MAX_LIMIT.max(1));

        let pool = Arc::new(Self {
            active_workers: Arc::new(AtomicI32::new(0)),
            active_lrg_workers: Arc::new(AtomicI32::new(0)),
            active_mrf_workers: Arc::new(AtomicI32::new(0)),
            priority: RwLock::new(opts.priority),
            max_workers: RwLock::new(max_workers),
            max_l_workers: RwLock::new(max_l_workers),
            stats,
            storage,
            workers: RwLock::new(Vec::new()),
            lrg_workers: RwLock::new(Vec::new()),
            mrf_replica_tx,
            mrf_replica_rx: Arc::new(Mutex::new(mrf_replica_rx)),
            mrf_save_tx,
            mrf_save_rx: Mutex::new(Some(mrf_save_rx)),
            mrf_worker_kill_tx,
            mrf_worker_size: AtomicI32::new(0),
            backlogged: AtomicBool::new(false),
            resyncer: Arc::new(ReplicationResyncer::new()),
        });

        pool.resize_lrg_workers(max_l_workers, 0).await;
        pool.resize_workers(workers, 0).await;
        pool.resize_failed_workers(failed_workers as i32).await;

        pool
    }

    pub fn active_workers(&self) -> i32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn active_mrf_workers(&self) -> i32 {
        self.active_mrf_workers.load(Ordering::SeqCst)
    }

    pub fn active_lrg_workers(&self) -> i32 {
        self.active_lrg_workers.load(Ordering::SeqCst)
    }

    pub fn resyncer(&self) -> Arc<ReplicationResyncer> {
        self.resyncer.clone()
    }

    fn spawn_worker(&self, mut rx: Receiver<ReplicationOperation>, active: Arc<AtomicI32>) {
        let stats = self.stats.clone();
        let storage = self.storage.clone();

        tokio::spawn(async move {
            while let Some(operation) = rx.recv().await {
                active.fetch_add(1, Ordering::SeqCst);

                match operation {
                    ReplicationOperation::Object(roi) => {
                        stats.inc_q(&roi.bucket, roi.size, roi.delete_marker, roi.op_type).await;
                        replicate_object(*roi.clone(), storage.clone()).await;
                        stats.dec_q(&roi.bucket, roi.size, roi.delete_marker, roi.op_type).await;
                    }
                    ReplicationOperation::Delete(doi) => {
                        stats.inc_q(&doi.bucket, 0, true, doi.op_type).await;
                        replicate_delete(*doi.clone(), storage.clone()).await;
                        stats.dec_q(&doi.bucket, 0, true, doi.op_type).await;
                    }
                }

                active.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    /// Grows or shrinks the regular worker set. Shrinking drops the
    /// surplus senders; their workers retire once their queues drain.
    pub async fn resize_workers(&self, n: usize, check_old: usize) {
        let mut workers = self.workers.write().await;

        if (check_old > 0 && workers.len() != check_old) || n == workers.len() || n < 1 {
            // Either already satisfied or the count changed while waiting
            // for the lock.
            return;
        }

        while workers.len() < n {
            let (tx, rx) = channel(REPLICATION_QUEUE_CAPACITY);
            workers.push(tx);
            self.spawn_worker(rx, self.active_workers.clone());
        }

        while workers.len() > n {
            workers.pop();
        }
    }

    pub async fn resize_lrg_workers(&self, n: usize, check_old: usize) {
        let mut lrg_workers = self.lrg_workers.write().await;

        if (check_old > 0 && lrg_workers.len() != check_old) || n == lrg_workers.len() || n < 1 {
            return;
        }

        while lrg_workers.len() < n {
            let (tx, rx) = channel(REPLICATION_QUEUE_CAPACITY);
            lrg_workers.push(tx);
            self.spawn_worker(rx, self.active_lrg_workers.clone());
        }

        while lrg_workers.len() > n {
            lrg_workers.pop();
        }
    }

    /// Adjusts the MRF worker set. Surplus workers are retired through
    /// the kill channel without disturbing in-flight items.
    pub async fn resize_failed_workers(&self, n: i32) {
        while self.mrf_worker_size.load(Ordering::SeqCst) < n {
            self.mrf_worker_size.fetch_add(1, Ordering::SeqCst);

            let rx = self.mrf_replica_rx.clone();
            let active = self.active_mrf_workers.clone();
            let stats = self.stats.clone();
            let storage = self.storage.clone();
            let mut kill_rx = self.mrf_worker_kill_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let operation = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = kill_rx.recv() => return,
                            op = guard.recv() => op,
                        }
                    };

                    let Some(operation) = operation else {
                        return;
                    };

                    active.fetch_add(1, Ordering::SeqCst);
                    match operation {
                        ReplicationOperation::Object(roi) => {
                            stats.inc_q(&roi.bucket, roi.size, roi.delete_marker, roi.op_type).await;
                            replicate_object(*roi.clone(), storage.clone()).await;
                            stats.dec_q(&roi.bucket, roi.size, roi.delete_marker, roi.op_type).await;
                        }
                        ReplicationOperation::Delete(doi) => {
                            replicate_delete(*doi, storage.clone()).await;
                        }
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        while self.mrf_worker_size.load(Ordering::SeqCst) > n {
            self.mrf_worker_size.fetch_sub(1, Ordering::SeqCst);
            let _ = self.mrf_worker_kill_tx.send(());
        }
    }

    pub async fn resize_worker_priority(&self, pri: ReplicationPriority, max_workers: Option<usize>, max_l_workers: Option<usize>) {
        let (workers, mrf_workers) = match pri {
            ReplicationPriority::Fast => (WORKER_MAX_LIMIT, MRF_WORKER_MAX_LIMIT),
            ReplicationPriority::Slow => (WORKER_MIN_LIMIT, MRF_WORKER_MIN_LIMIT),
            ReplicationPriority::Auto => {
                let mut workers = WORKER_AUTO_DEFAULT;
                let mut mrf_workers = MRF_WORKER_AUTO_DEFAULT;

                let current = self.workers.read().await.len();
                if current < WORKER_AUTO_DEFAULT {
                    workers = (current + 1).min(WORKER_AUTO_DEFAULT);
                }
                let current_mrf = self.mrf_worker_size.load(Ordering::SeqCst) as usize;
                if current_mrf < MRF_WORKER_AUTO_DEFAULT {
                    mrf_workers = (current_mrf + 1).min(MRF_WORKER_AUTO_DEFAULT);
                }
                (workers, mrf_workers)
            }
        };

        let (workers, mrf_workers) = if let Some(max_w) = max_workers {
            *self.max_workers.write().await = max_w;
            (workers.min(max_w), mrf_workers.min(max_w))
        } else {
            (workers, mrf_workers)
        };

        let max_l = max_l_workers.unwrap_or(LARGE_WORKER_COUNT);
        *self.max_l_workers.write().await = max_l;
        *self.priority.write().await = pri;

        self.resize_workers(workers, 0).await;
        self.resize_failed_workers(mrf_workers as i32).await;
        self.resize_lrg_workers(max_l, 0).await;
    }

    /// Stable worker choice so one object's updates stay ordered on the
    /// same worker.
    async fn get_worker_ch(&self, bucket: &str, object: &str) -> Option<Sender<ReplicationOperation>> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return None;
        }
        let idx = sip_hash(&format!("{bucket}/{object}"), workers.len(), &DEFAULT_SIP_HASH_KEY);
        workers.get(idx).cloned()
    }

    fn log_backlog_once(&self, priority: ReplicationPriority) {
        if self.backlogged.swap(true, Ordering::SeqCst) {
            return;
        }
        match priority {
            ReplicationPriority::Fast => {
                warn!("replication: unable to keep up with incoming traffic");
            }
            ReplicationPriority::Slow => {
                warn!("replication: unable to keep up with incoming traffic, consider raising replication priority");
            }
            ReplicationPriority::Auto => {
                info!("replication: backlog detected, scaling workers");
            }
        }
    }

    /// Non-blocking enqueue of an object replication task.
    pub async fn queue_replica_task(&self, ri: ReplicateObjectInfo) {
        // Large uploads get a dedicated worker set so a burst of big
        // objects cannot starve everything else.
        if ri.size >= MIN_LARGE_OBJ_SIZE {
            let lrg_workers = self.lrg_workers.read().await;
            if !lrg_workers.is_empty() {
                let idx = sip_hash(&format!("{}/{}", ri.bucket, ri.name), lrg_workers.len(), &DEFAULT_SIP_HASH_KEY);
                if let Some(worker) = lrg_workers.get(idx) {
                    if worker.try_send(ReplicationOperation::Object(Box::new(ri.clone()))).is_err() {
                        let _ = self.mrf_save_tx.try_send(ri.to_mrf_entry());

                        let max_l_workers = *self.max_l_workers.read().await;
                        let existing = lrg_workers.len();
                        if self.active_lrg_workers() < max_l_workers.min(LARGE_WORKER_COUNT) as i32 {
                            let want = (existing + 1).min(max_l_workers);
                            drop(lrg_workers);
                            self.resize_lrg_workers(want, existing).await;
                        }
                    }
                }
            }
            return;
        }

        let ch = match ri.op_type {
            ReplicationType::Heal | ReplicationType::ExistingObject => Some(self.mrf_replica_tx.clone()),
            _ => self.get_worker_ch(&ri.bucket, &ri.name).await,
        };

        let Some(ch) = ch else {
            warn!("replication: no workers available for {}/{}", ri.bucket, ri.name);
            return;
        };

        if ch.try_send(ReplicationOperation::Object(Box::new(ri.clone()))).is_ok() {
            self.backlogged.store(false, Ordering::SeqCst);
            return;
        }

        // Queue full: drop to the MRF save channel and keep serving live
        // traffic.
        let _ = self.mrf_save_tx.try_send(ri.to_mrf_entry());

        let priority = *self.priority.read().await;
        let max_workers = *self.max_workers.read().await;
        self.log_backlog_once(priority);

        if priority == ReplicationPriority::Auto {
            let max_w = max_workers.min(WORKER_MAX_LIMIT);
            if self.active_workers() < max_w as i32 {
                let existing = self.workers.read().await.len();
                self.resize_workers((existing + 1).min(max_w), existing).await;
            }

            let max_mrf = max_workers.min(MRF_WORKER_MAX_LIMIT);
            if self.active_mrf_workers() < max_mrf as i32 {
                let current = self.mrf_worker_size.load(Ordering::SeqCst);
                self.resize_failed_workers((current + 1).min(max_mrf as i32)).await;
            }
        }
    }

    /// Non-blocking enqueue of a delete replication task.
    pub async fn queue_replica_delete_task(&self, doi: DeletedObjectReplicationInfo) {
        let ch = match doi.op_type {
            ReplicationType::Heal | ReplicationType::ExistingObject => Some(self.mrf_replica_tx.clone()),
            _ => self.get_worker_ch(&doi.bucket, &doi.delete_object.object_name).await,
        };

        let Some(ch) = ch else {
            warn!(
                "replication: no workers available for delete {}/{}",
                doi.bucket, doi.delete_object.object_name
            );
            return;
        };

        if ch.try_send(ReplicationOperation::Delete(Box::new(doi.clone()))).is_ok() {
            self.backlogged.store(false, Ordering::SeqCst);
            return;
        }

        let _ = self.mrf_save_tx.try_send(doi.to_mrf_entry());

        let priority = *self.priority.read().await;
        let max_workers = *self.max_workers.read().await;
        self.log_backlog_once(priority);

        if priority == ReplicationPriority::Auto {
            let max_w = max_workers.min(WORKER_MAX_LIMIT);
            if self.active_workers() < max_w as i32 {
                let existing = self.workers.read().await.len();
                self.resize_workers((existing + 1).min(max_w), existing).await;
            }
        }
    }

    /// Drains saved MRF entries back through the heal path. The scanner
    /// triggers this with the object layer once the backlog clears.
    pub async fn take_mrf_entries(&self, max: usize) -> Vec<MrfReplicateEntry> {
        let mut out = Vec::new();
        let mut guard = self.mrf_save_rx.lock().await;
        if let Some(rx) = guard.as_mut() {
            while out.len() < max {
                match rx.try_recv() {
                    Ok(entry) => out.push(entry),
                    Err(_) => break,
                }
            }
        }
        out
    }
}

/// Object-safe view of the pool held in the process global.
#[async_trait::async_trait]
pub trait ReplicationPoolApi: std::fmt::Debug + Send + Sync {
    async fn queue_replica_task(&self, ri: ReplicateObjectInfo);
    async fn queue_replica_delete_task(&self, doi: DeletedObjectReplicationInfo);
    async fn resize(&self, priority: ReplicationPriority, max_workers: Option<usize>, max_l_workers: Option<usize>);
    fn resyncer_handle(&self) -> Arc<ReplicationResyncer>;
    fn active_workers_count(&self) -> i32;
    fn active_mrf_workers_count(&self) -> i32;
}

#[async_trait::async_trait]
impl<S: StorageAPI> ReplicationPoolApi for ReplicationPool<S> {
    async fn queue_replica_task(&self, ri: ReplicateObjectInfo) {
        ReplicationPool::queue_replica_task(self, ri).await
    }

    async fn queue_replica_delete_task(&self, doi: DeletedObjectReplicationInfo) {
        ReplicationPool::queue_replica_delete_task(self, doi).await
    }

    async fn resize(&self, priority: ReplicationPriority, max_workers: Option<usize>, max_l_workers: Option<usize>) {
        self.resize_worker_priority(priority, max_workers, max_l_workers).await
    }

    fn resyncer_handle(&self) -> Arc<ReplicationResyncer> {
        self.resyncer()
    }

    fn active_workers_count(&self) -> i32 {
        self.active_workers()
    }

    fn active_mrf_workers_count(&self) -> i32 {
        self.active_mrf_workers()
    }
}

static GLOBAL_REPLICATION_POOL: OnceCell<Arc<dyn ReplicationPoolApi>> = OnceCell::const_new();

pub fn global_replication_pool() -> Option<Arc<dyn ReplicationPoolApi>> {
    GLOBAL_REPLICATION_POOL.get().cloned()
}

/// Boots the replication pool and stats once the object layer is up.
pub async fn init_background_replication<S: StorageAPI>(storage: Arc<S>, opts: ReplicationPoolOpts) {
    let stats = Arc::new(ReplicationStats::new());
    set_global_replication_stats(stats.clone());

    let pool = ReplicationPool::new(opts, stats, storage).await;
    let _ = GLOBAL_REPLICATION_POOL.set(pool as Arc<dyn ReplicationPoolApi>);
}

/// Re-enqueues a failed item on the MRF queue; op_type is already Heal so
/// it lands with the failed workers.
pub async fn requeue_on_mrf(ri: ReplicateObjectInfo) {
    if let Some(pool) = global_replication_pool() {
        pool.queue_replica_task(ri).await;
    }
}

/// Builds the work item for a fresh write and either runs it inline
/// (synchronous targets) or enqueues it.
pub async fn schedule_replication<S: StorageAPI>(oi: ObjectInfo, storage: Arc<S>, dsc: ReplicateDecision, op_type: ReplicationType) {
    let tgt_statuses = replication_statuses_map(oi.replication_status_internal.as_deref().unwrap_or_default());
    let purge_statuses = version_purge_statuses_map(oi.version_purge_status_internal.as_deref().unwrap_or_default());
    let tm = oi
        .user_defined
        .get(&format!("{RESERVED_METADATA_PREFIX_LOWER}replication-timestamp"))
        .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok());

    let mut rstate = oi.replication_state();
    rstate.replicate_decision_str = dsc.to_string();
    let actual_size = oi.get_actual_size().unwrap_or_default();

    let ri = ReplicateObjectInfo {
        name: oi.name.clone(),
        size: oi.size,
        actual_size,
        bucket: oi.bucket.clone(),
        version_id: oi.version_id,
        etag: oi.etag.clone(),
        mod_time: oi.mod_time,
        replication_status: oi.replication_status.clone(),
        replication_status_internal: oi.replication_status_internal.clone(),
        delete_marker: oi.delete_marker,
        version_purge_status_internal: oi.version_purge_status_internal.clone(),
        version_purge_status: oi.version_purge_status.clone(),
        replication_state: Some(rstate),
        op_type,
        dsc: dsc.clone(),
        target_statuses: tgt_statuses,
        target_purge_statuses: purge_statuses,
        replication_timestamp: tm,
        user_tags: oi.user_tags.clone(),
        existing_obj_resync: ResyncDecision::default(),
        ..Default::default()
    };

    if dsc.is_synchronous() {
        replicate_object(ri, storage).await;
    } else if let Some(pool) = global_replication_pool() {
        pool.queue_replica_task(ri).await;
    }
}

/// Enqueues a delete replication and registers the pending transition
/// with the stats layer.
pub async fn schedule_replication_delete(dv: DeletedObjectReplicationInfo) {
    if let Some(pool) = global_replication_pool() {
        pool.queue_replica_delete_task(dv.clone()).await;
    }

    if let (Some(rs), Some(stats)) = (
        dv.delete_object.replication_state.as_ref(),
        crate::bucket::replication::replication_stats::global_replication_stats(),
    ) {
        for arn in rs.targets.keys() {
            let ri = garnetfs_filemeta::ReplicatedTargetInfo {
                arn: arn.clone(),
                size: 0,
                op_type: ReplicationType::Delete,
                ..Default::default()
            };
            stats
                .update(&dv.bucket, &ri, ReplicationStatusType::Pending, ReplicationStatusType::Empty)
                .await;
        }
    }
}
