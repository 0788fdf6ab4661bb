//! Router pool manager.
//!
//! Every channel owns a pool with one router per media worker. The instance
//! pool is created at startup; other pools are created on first use.
//!
//! # Selection
//!
//! `select_router` queries the live transport count of every router in the
//! pool and picks the smallest, ties going to pool order. Selections still
//! waiting on their engine allocation are counted through a per-router
//! reservation, so a burst of concurrent transport creations spreads across
//! workers instead of piling onto the router that looked emptiest.

use crate::engine::{MediaEngine, RtpCapabilities};
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::types::{ChannelKey, RouterId, WorkerId};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

/// One router in a pool.
#[derive(Debug)]
pub struct RouterHandle {
    pub id: RouterId,
    pub worker_id: WorkerId,
    pub rtp_capabilities: RtpCapabilities,
    reserved: AtomicUsize,
}

impl RouterHandle {
    /// Selections handed out for this router that have not been released yet.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }
}

/// Routers of one channel, in worker order.
#[derive(Debug)]
pub struct RouterPool {
    channel: ChannelKey,
    routers: Vec<Arc<RouterHandle>>,
    selection: Mutex<()>,
}

impl RouterPool {
    #[must_use]
    pub fn channel(&self) -> &ChannelKey {
        &self.channel
    }

    #[must_use]
    pub fn routers(&self) -> &[Arc<RouterHandle>] {
        &self.routers
    }

    #[must_use]
    pub fn first(&self) -> Option<&Arc<RouterHandle>> {
        self.routers.first()
    }

    #[must_use]
    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.iter().map(|r| r.id).collect()
    }

    #[must_use]
    pub fn contains(&self, router_id: RouterId) -> bool {
        self.routers.iter().any(|r| r.id == router_id)
    }
}

/// A selected router. The reservation is released on drop.
#[derive(Debug)]
pub struct RouterReservation {
    router: Arc<RouterHandle>,
}

impl RouterReservation {
    #[must_use]
    pub fn router_id(&self) -> RouterId {
        self.router.id
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.router.worker_id
    }
}

impl Drop for RouterReservation {
    fn drop(&mut self) {
        self.router.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the media workers and every channel's router pool.
pub struct RouterPoolManager {
    engine: Arc<dyn MediaEngine>,
    workers: Vec<WorkerId>,
    instance: Arc<RouterPool>,
    pools: RwLock<HashMap<ChannelKey, Arc<OnceCell<Arc<RouterPool>>>>>,
}

impl RouterPoolManager {
    /// Create `worker_count` workers and the instance pool.
    pub async fn start(engine: Arc<dyn MediaEngine>, worker_count: usize) -> Result<Self, SfuError> {
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            workers.push(engine.create_worker().await?);
        }
        let instance = create_pool(engine.as_ref(), &workers, ChannelKey::instance()).await?;

        info!(
            target: "sfu.routers",
            workers = workers.len(),
            "Media workers and instance routers created"
        );

        Ok(Self {
            engine,
            workers,
            instance,
            pools: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    /// The startup-created instance pool.
    #[must_use]
    pub fn instance_pool(&self) -> Arc<RouterPool> {
        Arc::clone(&self.instance)
    }

    /// Pool for a channel, creating one router per worker on first use.
    ///
    /// Concurrent first uses of the same channel create the pool once. A
    /// failed creation leaves the channel without a pool so a later call can
    /// retry.
    pub async fn pool_for(&self, channel: &ChannelKey) -> Result<Arc<RouterPool>, SfuError> {
        if channel.is_instance() {
            return Ok(self.instance_pool());
        }

        let cell = {
            let existing = self.pools.read().await.get(channel).cloned();
            match existing {
                Some(cell) => cell,
                None => Arc::clone(
                    self.pools
                        .write()
                        .await
                        .entry(channel.clone())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                ),
            }
        };

        let pool = cell
            .get_or_try_init(|| create_pool(self.engine.as_ref(), &self.workers, channel.clone()))
            .await?;
        Ok(Arc::clone(pool))
    }

    /// Pool for a channel if it already exists.
    pub async fn existing_pool(&self, channel: &ChannelKey) -> Option<Arc<RouterPool>> {
        if channel.is_instance() {
            return Some(self.instance_pool());
        }
        self.pools
            .read()
            .await
            .get(channel)
            .and_then(|cell| cell.get().cloned())
    }

    /// Pool that hosts a router, if any.
    pub async fn pool_of_router(&self, router_id: RouterId) -> Option<Arc<RouterPool>> {
        if self.instance.contains(router_id) {
            return Some(self.instance_pool());
        }
        self.pools
            .read()
            .await
            .values()
            .filter_map(|cell| cell.get())
            .find(|pool| pool.contains(router_id))
            .cloned()
    }

    /// Pick the least loaded router of the channel's pool.
    pub async fn select_router(&self, channel: &ChannelKey) -> Result<RouterReservation, SfuError> {
        let pool = self.pool_for(channel).await?;
        if pool.routers.is_empty() {
            return Err(SfuError::NoAvailableRouter(format!(
                "pool for {channel} has no routers"
            )));
        }

        let _selection = pool.selection.lock().await;

        let mut best: Option<(usize, &Arc<RouterHandle>)> = None;
        for router in &pool.routers {
            let load = match self.engine.router_load(router.id).await {
                Ok(load) => load,
                Err(e) => {
                    warn!(
                        target: "sfu.routers",
                        router_id = %router.id,
                        channel = %channel,
                        error = %e,
                        "Router load query failed, skipping router"
                    );
                    continue;
                }
            };
            let effective = load + router.reserved();
            // Strictly smaller only, so ties keep the earlier router.
            if best.map_or(true, |(current, _)| effective < current) {
                best = Some((effective, router));
            }
        }

        let (load, router) = best.ok_or_else(|| {
            SfuError::NoAvailableRouter(format!("no router of {channel} reported its load"))
        })?;
        router.reserved.fetch_add(1, Ordering::SeqCst);
        metrics::record_router_selection(channel.metric_label());

        debug!(
            target: "sfu.routers",
            router_id = %router.id,
            worker_id = %router.worker_id,
            channel = %channel,
            load = load,
            "Router selected"
        );

        Ok(RouterReservation {
            router: Arc::clone(router),
        })
    }
}

async fn create_pool(
    engine: &dyn MediaEngine,
    workers: &[WorkerId],
    channel: ChannelKey,
) -> Result<Arc<RouterPool>, SfuError> {
    let mut routers = Vec::with_capacity(workers.len());
    for worker_id in workers {
        let info = engine.create_router(*worker_id).await?;
        routers.push(Arc::new(RouterHandle {
            id: info.id,
            worker_id: info.worker_id,
            rtp_capabilities: info.rtp_capabilities,
            reserved: AtomicUsize::new(0),
        }));
    }

    debug!(
        target: "sfu.routers",
        channel = %channel,
        routers = routers.len(),
        "Router pool created"
    );

    Ok(Arc::new(RouterPool {
        channel,
        routers,
        selection: Mutex::new(()),
    }))
}
