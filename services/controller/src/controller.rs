//! Controller wiring.
//!
//! Builds the index, queue, executor, reconciler and garbage collector around
//! a store and a substrate, and runs:
//! - one watch ingestor per resource kind
//! - a bounded pool of workers pulling identities from the queue
//! - the periodic garbage collector
//!
//! On shutdown the queue stops handing out work, in-flight passes finish
//! their current action set, and everything is joined within a grace period.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use kubesolv_events::Trigger;
use kubesolv_id::ResourceKind;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::executor::{ActionExecutor, WritePolicy};
use crate::gc::GarbageCollector;
use crate::index::DependencyIndex;
use crate::ingest::WatchIngestor;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, ReconcilerSettings, Requeue};
use crate::store::ResourceStore;
use crate::substrate::ExecutionSubstrate;

/// Validated, immutable process settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub workers: usize,
    pub reconciler: ReconcilerSettings,
    pub write_policy: WritePolicy,
    pub gc_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            reconciler: ReconcilerSettings::default(),
            write_policy: WritePolicy::default(),
            gc_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct Controller {
    store: Arc<dyn ResourceStore>,
    index: Arc<DependencyIndex>,
    queue: Arc<WorkQueue>,
    executor: Arc<ActionExecutor>,
    reconciler: Arc<Reconciler>,
    gc: Arc<GarbageCollector>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        settings: ControllerSettings,
    ) -> Self {
        let index = Arc::new(DependencyIndex::new());
        let queue = Arc::new(WorkQueue::new());
        let executor = Arc::new(ActionExecutor::new(
            store.clone(),
            substrate.clone(),
            settings.write_policy.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            index.clone(),
            executor.clone(),
            substrate,
            settings.reconciler.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            store.clone(),
            index.clone(),
            executor.clone(),
            settings.gc_interval,
        ));

        Self {
            store,
            index,
            queue,
            executor,
            reconciler,
            gc,
            settings,
        }
    }

    pub fn index(&self) -> &Arc<DependencyIndex> {
        &self.index
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    /// A watch ingestor for `kind` wired to this controller's index and queue.
    pub fn ingestor(&self, kind: ResourceKind) -> WatchIngestor {
        WatchIngestor::new(
            kind,
            self.store.clone(),
            self.index.clone(),
            self.queue.clone(),
        )
    }

    /// Run until the shutdown signal is received, then drain.
    #[instrument(skip(self, shutdown), name = "controller")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.settings.workers, "Starting controller");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for kind in ResourceKind::ALL {
            let ingestor = self.ingestor(kind);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { ingestor.run(shutdown).await }));
        }

        for id in 0..self.settings.workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            handles.push(tokio::spawn(run_worker(id, queue, reconciler)));
        }

        let gc = self.gc.clone();
        let gc_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { gc.run(gc_shutdown).await }));

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Controller shutting down");
        self.queue.shutdown();

        if tokio::time::timeout(self.settings.shutdown_grace, join_all(handles))
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.settings.shutdown_grace.as_secs(),
                "Workers did not shut down in time"
            );
        }
        info!("Controller stopped");
    }
}

/// Pull identities until the queue shuts down.
#[instrument(skip(queue, reconciler), name = "worker")]
async fn run_worker(id: usize, queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>) {
    debug!("Worker started");
    while let Some(target) = queue.dequeue().await {
        let report = reconciler.reconcile(&target).await;
        queue.done(&target);

        match report.requeue {
            Requeue::Done => {}
            Requeue::Immediately => {
                queue.enqueue(target, Trigger::Requeue);
            }
            Requeue::After(delay) => {
                queue.enqueue_after(target, delay);
            }
        }
    }
    debug!("Worker stopped");
}
