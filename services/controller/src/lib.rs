//! kubesolv controller library.
//!
//! The controller converges `Solver`, `CubeState` and `SolveJob` resources
//! held in a resource store. It ships a `kubesolv-controller` binary; the
//! library surface exists for integration testing and embedding.
//!
//! ## Architecture
//!
//! ```text
//! ResourceStore --watch--> WatchIngestor --> DependencyIndex
//!                               |
//!                               v
//!                           WorkQueue --> workers --> Reconciler --> ActionExecutor
//!                                                        |               |
//!                                                        v               v
//!                                               ExecutionSubstrate  ResourceStore
//! ```
//!
//! The `GarbageCollector` runs alongside and deletes children whose owner is
//! gone.

pub mod config;
pub mod controller;
pub mod executor;
pub mod gc;
pub mod index;
pub mod ingest;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod store;
pub mod substrate;

// Re-export commonly used types
pub use controller::{Controller, ControllerSettings};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerSettings, Requeue};
pub use store::{InMemoryStore, ResourceStore};
pub use substrate::{ExecutionSubstrate, MockSubstrate};
