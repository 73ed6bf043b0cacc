//! Process lifecycle: start/stop ordering, signals, stats dumps.
//!
//! Start order is auth key, worker pool, HTTP + gateway; stop is the
//! reverse and idempotent. Signals: interrupt shuts down cleanly, hangup
//! restarts, USR1 soft-resets (closes every channel, keeps serving), USR2
//! logs stats.

use std::{sync::Arc, time::Duration};

use eyre::Result;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use warp::Filter;

use crate::{
    channel::Registry,
    config::Config,
    gateway::Gateway,
    http::{self, AppState},
    media::{WorkerSettings, WorkerSpawner},
    worker::WorkerPool,
};

struct Running {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

pub struct Supervisor {
    config: Arc<Config>,
    spawner: Arc<dyn WorkerSpawner>,
    running: Mutex<Option<Running>>,
}

impl Supervisor {
    pub fn new(config: Config, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            spawner,
            running: Mutex::new(None),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let auth_key = self.config.auth_key_bytes()?;

        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let size = self
            .config
            .num_workers
            .unwrap_or(parallelism)
            .min(parallelism);

        let settings = WorkerSettings {
            rtc_interface: self.config.rtc_interface,
            public_ip: self.config.public_ip,
            rtc_min_port: self.config.rtc_min_port,
            rtc_max_port: self.config.rtc_max_port,
        };
        let pool = WorkerPool::start(self.spawner.clone(), settings, size).await;

        let registry = Registry::new(self.config.clone(), pool.clone());
        let gateway = Gateway::new(registry.clone(), self.config.clone(), auth_key.clone());

        let state = Arc::new(AppState {
            registry: registry.clone(),
            gateway,
            config: self.config.clone(),
            auth_key,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = http::routes(state).recover(http::handle_rejection);
        let (addr, server) = warp::serve(app).bind_with_graceful_shutdown(
            (self.config.http_interface, self.config.port),
            async {
                let _result = shutdown_rx.await;
            },
        );
        let server = tokio::spawn(server);

        info!(%addr, "listening");

        *running = Some(Running {
            registry,
            pool,
            shutdown: shutdown_tx,
            server,
        });

        Ok(())
    }

    /// Idempotent: stopping a stopped supervisor is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _result = running.shutdown.send(());

        // closing channels tears down every session and with it every open
        // link, which lets the graceful HTTP shutdown drain
        running.registry.close_all().await;
        running.pool.stop().await;

        if tokio::time::timeout(Duration::from_secs(5), running.server)
            .await
            .is_err()
        {
            warn!("http server did not drain in time");
        }

        info!("stopped");
    }

    pub async fn restart(&self) -> Result<()> {
        info!("restarting");
        self.stop().await;
        self.start().await
    }

    /// Closes every channel but keeps the services up.
    pub async fn soft_reset(&self) {
        info!("soft reset");
        if let Some(running) = &*self.running.lock().await {
            running.registry.close_all().await;
        }
    }

    pub async fn dump_stats(&self) {
        let registry = {
            let running = self.running.lock().await;
            running.as_ref().map(|running| running.registry.clone())
        };
        let Some(registry) = registry else {
            return;
        };

        let stats = registry.stats().await;
        let incoming: u64 = stats.iter().map(|s| s.bitrates.total).sum();

        for channel in &stats {
            info!(
                channel = %channel.uuid,
                sessions = channel.session_count,
                bitrate = channel.bitrates.total,
                "channel stats"
            );
        }
        info!(
            channels = stats.len(),
            incoming_bitrate = incoming,
            "process stats"
        );
    }

    /// Starts the services and parks on the signal loop until interrupted.
    /// Uncaught trouble from individual links or sessions never lands here;
    /// it is logged where it happens.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    info!("interrupted, shutting down");
                    self.stop().await;
                    return Ok(());
                }
                _ = hangup.recv() => {
                    if let Err(e) = self.restart().await {
                        warn!("restart failed: {e}");
                    }
                }
                _ = usr1.recv() => self.soft_reset().await,
                _ = usr2.recv() => self.dump_stats().await,
            }
        }
    }
}
