//! # kubesolv-id
//!
//! Resource identity types for the kubesolv controller.
//!
//! ## Design Principles
//!
//! - Every resource is identified by its kind plus a `namespace/name` key
//! - Names are user-controlled and immutable once the resource exists
//! - The store assigns a [`Uid`] on create; a recreated resource gets a new one
//! - Every write bumps the [`ResourceVersion`], the optimistic-concurrency token
//! - Keys are typed per kind so an owner key can never be confused with a child key
//!
//! ## Key Format
//!
//! Keys use the canonical `{namespace}/{name}` form:
//! - `default/s1` (a `SolverKey`)
//! - `default/c1` (a `CubeStateKey`)
//!
//! An [`ObjectRef`] pairs a kind with a key and prints as `{Kind}/{namespace}/{name}`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
