//! Fixed pool of media-engine workers.
//!
//! Selection is by lowest resident memory, queried in parallel. A worker that
//! dies is replaced with exponential backoff, capped so a broken engine
//! cannot respawn forever; the pool keeps serving with whatever slots remain.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use eyre::Result;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::{
    errors::Error,
    media::{MediaWorker, WebRtcServer, WorkerSettings, WorkerSpawner},
    metrics::WORKER_RESPAWNS,
};

const RESPAWN_ATTEMPTS: u32 = 5;
const RESPAWN_BACKOFF: Duration = Duration::from_millis(500);
const RESPAWN_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// An engine worker together with the socket set its transports share.
pub struct PoolWorker {
    pub worker: Arc<dyn MediaWorker>,
    pub server: Arc<dyn WebRtcServer>,
}

pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    settings: WorkerSettings,
    workers: Mutex<Vec<Arc<PoolWorker>>>,
}

impl WorkerPool {
    /// Spawns `size` workers. Individual spawn failures are logged and the
    /// pool starts with fewer slots; only a pool with zero slots is unable to
    /// host WebRTC channels.
    pub async fn start(
        spawner: Arc<dyn WorkerSpawner>,
        settings: WorkerSettings,
        size: usize,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            spawner,
            settings,
            workers: Mutex::new(Vec::with_capacity(size)),
        });

        for slot in 0..size {
            match pool.spawn_one().await {
                Ok(worker) => pool.install(worker).await,
                Err(e) => warn!(slot, "failed to spawn media worker: {e}"),
            }
        }

        let count = pool.workers.lock().await.len();
        debug!(count, "worker pool started");

        pool
    }

    /// Returns the worker with the lowest resident memory. Usage queries run
    /// in parallel; a worker that fails to answer sorts last.
    pub async fn get(&self) -> Result<Arc<PoolWorker>> {
        let workers = self.workers.lock().await.clone();
        if workers.is_empty() {
            return Err(Error::Media("no media workers available".into()).into());
        }

        let usages = join_all(
            workers
                .iter()
                .map(|entry| async { entry.worker.resource_usage().await.unwrap_or(u64::MAX) }),
        )
        .await;

        let (index, _usage) = usages
            .iter()
            .enumerate()
            .min_by_key(|(_, usage)| **usage)
            .expect("pool is non-empty");

        Ok(workers[index].clone())
    }

    pub async fn size(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn stop(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for entry in workers {
            entry.worker.close().await;
        }
    }

    async fn spawn_one(self: &Arc<Self>) -> Result<Arc<PoolWorker>> {
        let worker = self.spawner.spawn(&self.settings).await?;
        let server = worker.create_webrtc_server().await?;

        Ok(Arc::new(PoolWorker { worker, server }))
    }

    fn install(
        self: &Arc<Self>,
        entry: Arc<PoolWorker>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.workers.lock().await.push(entry.clone());

            let pool = self.clone();
            tokio::spawn(async move {
                entry.worker.died().await;
                pool.replace(&entry).await;
            });
        })
    }

    async fn replace(self: &Arc<Self>, dead: &Arc<PoolWorker>) {
        {
            let mut workers = self.workers.lock().await;
            workers.retain(|entry| !Arc::ptr_eq(entry, dead));
        }

        warn!("media worker died, spawning replacement");
        WORKER_RESPAWNS.inc();

        let mut backoff = RESPAWN_BACKOFF;
        for attempt in 1..=RESPAWN_ATTEMPTS {
            match self.spawn_one().await {
                Ok(worker) => {
                    self.install(worker).await;
                    return;
                }
                Err(e) => {
                    warn!(attempt, "replacement worker failed to spawn: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESPAWN_BACKOFF_CEILING);
                }
            }
        }

        error!(
            attempts = RESPAWN_ATTEMPTS,
            "giving up on replacing dead media worker"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::*;
    use crate::media::{MediaRouter, RtpCodec};

    struct FakeWorker {
        usage: AtomicU64,
        death: watch::Sender<bool>,
    }

    impl FakeWorker {
        fn new(usage: u64) -> Arc<Self> {
            Arc::new(Self {
                usage: AtomicU64::new(usage),
                death: watch::channel(false).0,
            })
        }

        fn kill(&self) {
            let _ignored = self.death.send(true);
        }
    }

    struct FakeServer;

    impl WebRtcServer for FakeServer {
        fn id(&self) -> String {
            "srv".into()
        }
    }

    #[async_trait]
    impl MediaWorker for FakeWorker {
        async fn resource_usage(&self) -> Result<u64> {
            Ok(self.usage.load(Ordering::Relaxed))
        }

        async fn create_router(&self, _codecs: Vec<RtpCodec>) -> Result<Arc<dyn MediaRouter>> {
            unimplemented!("not exercised here")
        }

        async fn create_webrtc_server(&self) -> Result<Arc<dyn WebRtcServer>> {
            Ok(Arc::new(FakeServer))
        }

        async fn died(&self) {
            let mut rx = self.death.subscribe();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }

        async fn close(&self) {}
    }

    struct FakeSpawner {
        usages: Mutex<Vec<u64>>,
        spawned: AtomicUsize,
        workers: Mutex<Vec<Arc<FakeWorker>>>,
    }

    #[async_trait]
    impl WorkerSpawner for FakeSpawner {
        async fn spawn(&self, _settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
            self.spawned.fetch_add(1, Ordering::Relaxed);
            let usage = self.usages.lock().await.remove(0);
            let worker = FakeWorker::new(usage);
            self.workers.lock().await.push(worker.clone());
            Ok(worker)
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            rtc_interface: "127.0.0.1".parse().unwrap(),
            public_ip: "127.0.0.1".parse().unwrap(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }

    #[tokio::test]
    async fn picks_lowest_memory_worker() {
        let spawner = Arc::new(FakeSpawner {
            usages: Mutex::new(vec![300, 100, 200]),
            spawned: AtomicUsize::new(0),
            workers: Mutex::new(vec![]),
        });

        let pool = WorkerPool::start(spawner, settings(), 3).await;
        assert_eq!(pool.size().await, 3);

        let picked = pool.get().await.unwrap();
        assert_eq!(picked.worker.resource_usage().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn replaces_dead_worker() {
        let spawner = Arc::new(FakeSpawner {
            usages: Mutex::new(vec![100, 50]),
            spawned: AtomicUsize::new(0),
            workers: Mutex::new(vec![]),
        });

        let pool = WorkerPool::start(spawner.clone(), settings(), 1).await;
        assert_eq!(pool.size().await, 1);

        spawner.workers.lock().await[0].kill();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.size().await, 1);
        assert_eq!(spawner.spawned.load(Ordering::Relaxed), 2);

        let picked = pool.get().await.unwrap();
        assert_eq!(picked.worker.resource_usage().await.unwrap(), 50);
    }

    #[tokio::test]
    async fn empty_pool_refuses() {
        struct NeverSpawner;

        #[async_trait]
        impl WorkerSpawner for NeverSpawner {
            async fn spawn(&self, _settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
                Err(eyre::eyre!("engine not linked"))
            }
        }

        let pool = WorkerPool::start(Arc::new(NeverSpawner), settings(), 2).await;
        assert_eq!(pool.size().await, 0);

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Media(_))));
    }
}
