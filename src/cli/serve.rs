use std::sync::Arc;

use async_trait::async_trait;
use cata::{command::Container, output::Format, Command};
use clap::Parser;
use eyre::Result;
use tracing::warn;

use crate::{
    config::Config,
    media::{MediaWorker, WorkerSettings, WorkerSpawner},
    supervisor::Supervisor,
};

#[derive(Parser)]
pub struct Serve {
    #[clap(from_global)]
    pub output: Format,

    #[command(flatten)]
    config: Config,
}

impl Container for Serve {
    fn next(&self) -> Option<&dyn Command> {
        None
    }
}

/// Stands in until an engine integration is linked. Every spawn fails, the
/// pool comes up empty, and only data-only channels can be created.
struct NullSpawner;

#[async_trait]
impl WorkerSpawner for NullSpawner {
    async fn spawn(&self, _settings: &WorkerSettings) -> Result<Arc<dyn MediaWorker>> {
        Err(eyre::eyre!("no media engine linked into this build"))
    }
}

#[async_trait]
impl Command for Serve {
    async fn run(&self) -> Result<()> {
        warn!("serving without a media engine; only data-only channels will work");

        Supervisor::new(self.config.clone(), Arc::new(NullSpawner))
            .run()
            .await
    }
}
