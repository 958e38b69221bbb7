//! End-to-end tests for the running controller: watch ingestion, the worker
//! pool, delayed requeues and shutdown, against InMemoryStore and
//! MockSubstrate.

use std::sync::Arc;
use std::time::Duration;

use kubesolv_controller::resources::{
    CubeState, CubeStatePhase, FailureReason, Resource, SolveJob, SolveJobPhase, Solver,
    SolverSpec,
};
use kubesolv_controller::{
    Controller, ControllerSettings, InMemoryStore, MockSubstrate, ReconcilerSettings,
    ResourceStore,
};
use kubesolv_id::{CubeStateKey, ResourceKind, SolveJobKey, SolverKey};
use kubesolv_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

struct Running {
    store: Arc<InMemoryStore>,
    substrate: Arc<MockSubstrate>,
    controller: Arc<Controller>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    fn start(substrate: MockSubstrate, settings: ControllerSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let substrate = Arc::new(substrate);
        let controller = Arc::new(Controller::new(store.clone(), substrate.clone(), settings));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(shutdown_rx).await })
        };
        Self {
            store,
            substrate,
            controller,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(WAIT_LIMIT, self.handle)
            .await
            .expect("controller did not stop")
            .unwrap();
    }

    async fn solver(&self, key: &SolverKey) -> Option<Solver> {
        self.store
            .get(&key.object_ref())
            .await
            .unwrap()
            .and_then(Resource::into_solver)
    }

    async fn cube_states(&self) -> usize {
        self.store.list(ResourceKind::CubeState).await.unwrap().len()
    }

    async fn job(&self, key: &SolveJobKey) -> Option<SolveJob> {
        self.store
            .get(&key.object_ref())
            .await
            .unwrap()
            .and_then(Resource::into_solve_job)
    }
}

fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        workers: 4,
        reconciler: ReconcilerSettings {
            max_job_retries: 2,
            job_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            drain_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            error_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(50)),
        },
        gc_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(2),
        ..ControllerSettings::default()
    }
}

/// Bounds a polling loop.
struct Deadline {
    what: &'static str,
    at: Instant,
}

impl Deadline {
    fn new(what: &'static str) -> Self {
        Self {
            what,
            at: Instant::now() + WAIT_LIMIT,
        }
    }

    async fn tick(&self) {
        assert!(Instant::now() < self.at, "timed out waiting for {}", self.what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_seeded_solver_runs_job_to_completion() {
    let running = Running::start(MockSubstrate::new(), fast_settings());
    let s1 = SolverKey::new("default", "s1").unwrap();
    let solver = running
        .store
        .create(
            Solver::new(
                s1.clone(),
                SolverSpec::new("cfop").with_initial_state(serde_json::json!({ "faces": "RUF" })),
            )
            .into(),
        )
        .await
        .unwrap()
        .into_solver()
        .unwrap();
    let seed = solver.seed_cube_key().unwrap();

    let deadline = Deadline::new("seed cube state");
    while running.cube_states().await == 0 {
        deadline.tick().await;
    }

    let j1 = SolveJobKey::new("default", "j1").unwrap();
    running
        .store
        .create(SolveJob::new(j1.clone(), solver.owner_reference(), seed.clone()).into())
        .await
        .unwrap();

    let deadline = Deadline::new("job to succeed");
    let succeeded = |job: SolveJob| job.status.phase == SolveJobPhase::Succeeded;
    while !running.job(&j1).await.is_some_and(succeeded) {
        deadline.tick().await;
    }

    let cube = running
        .store
        .get(&seed.object_ref())
        .await
        .unwrap()
        .and_then(Resource::into_cube_state)
        .unwrap();
    assert_eq!(cube.status.phase, CubeStatePhase::Ready);
    assert_eq!(cube.status.revision, 1);
    assert_eq!(cube.spec.snapshot["solved"], serde_json::json!(true));
    assert_eq!(running.substrate.starts(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_failing_job_stops_after_retry_budget() {
    let running = Running::start(MockSubstrate::failing("unsolvable"), fast_settings());
    let s1 = SolverKey::new("default", "s1").unwrap();
    let solver = running
        .store
        .create(Solver::new(s1, SolverSpec::new("cfop")).into())
        .await
        .unwrap()
        .into_solver()
        .unwrap();
    let c1 = CubeStateKey::new("default", "c1").unwrap();
    running
        .store
        .create(CubeState::new(c1.clone(), solver.owner_reference(), serde_json::json!({})).into())
        .await
        .unwrap();
    let j1 = SolveJobKey::new("default", "j1").unwrap();
    running
        .store
        .create(SolveJob::new(j1.clone(), solver.owner_reference(), c1).into())
        .await
        .unwrap();

    let deadline = Deadline::new("job to fail permanently");
    while !running.job(&j1).await.is_some_and(|job| job.status.is_terminal()) {
        deadline.tick().await;
    }

    let job = running.job(&j1).await.unwrap();
    assert_eq!(job.status.phase, SolveJobPhase::Failed);
    assert_eq!(job.status.retry_count, 2);
    assert_eq!(
        job.status.last_error.unwrap().reason,
        FailureReason::ExecutionFailed
    );
    assert_eq!(running.substrate.starts(), 3);

    running.stop().await;
}

#[tokio::test]
async fn test_deleting_solver_removes_everything() {
    let running = Running::start(MockSubstrate::new(), fast_settings());
    let s1 = SolverKey::new("default", "s1").unwrap();
    let solver = running
        .store
        .create(Solver::new(s1.clone(), SolverSpec::new("cfop")).into())
        .await
        .unwrap()
        .into_solver()
        .unwrap();
    for i in 0..4 {
        let cube = CubeStateKey::new("default", format!("c{i}")).unwrap();
        running
            .store
            .create(
                CubeState::new(cube, solver.owner_reference(), serde_json::json!({ "n": i }))
                    .into(),
            )
            .await
            .unwrap();
    }

    let deadline = Deadline::new("solver to count its children");
    while !running
        .solver(&s1)
        .await
        .is_some_and(|solver| solver.status.cube_states == 4)
    {
        deadline.tick().await;
    }

    running.store.delete(&s1.object_ref(), None).await.unwrap();

    let deadline = Deadline::new("store to empty");
    while !running.store.is_empty().await {
        deadline.tick().await;
    }
    let deadline = Deadline::new("index to forget the solver");
    while running.controller.index().has_solver(&s1).await {
        deadline.tick().await;
    }

    running.stop().await;
}

#[tokio::test]
async fn test_gc_collects_orphan_without_events() {
    let running = Running::start(MockSubstrate::new(), fast_settings());
    let s1 = SolverKey::new("default", "s1").unwrap();
    let solver = running
        .store
        .create(Solver::new(s1.clone(), SolverSpec::new("cfop")).into())
        .await
        .unwrap()
        .into_solver()
        .unwrap();
    let c1 = CubeStateKey::new("default", "c1").unwrap();
    running
        .store
        .create(CubeState::new(c1, solver.owner_reference(), serde_json::json!({})).into())
        .await
        .unwrap();

    let deadline = Deadline::new("solver to see its child");
    while !running
        .solver(&s1)
        .await
        .is_some_and(|solver| solver.status.cube_states == 1)
    {
        deadline.tick().await;
    }

    running.store.evict_silently(&s1.object_ref()).await.unwrap();

    let deadline = Deadline::new("orphan to be collected");
    while running.cube_states().await > 0 {
        deadline.tick().await;
    }

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_with_idle_queue() {
    let running = Running::start(MockSubstrate::new(), fast_settings());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(running.controller.queue().is_empty());
    let queue = Arc::clone(running.controller.queue());

    running.stop().await;
    assert!(queue.is_shutting_down());
}
