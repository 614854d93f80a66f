//! The async side of an optimistic-rollup fraud-proof client.
//!
//! Two loops follow the rollup contract on L1:
//!
//! - [`AssertionValidator`](validator::AssertionValidator) re-executes every
//!   assertion posted by someone else against the local L2 chain. When the
//!   result differs it posts a counter-assertion and opens a challenge.
//! - [`BisectionClient`](bisection::BisectionClient) plays each challenge
//!   naming the operator, narrowing the disputed segment by bisection until a
//!   single step is left, and proving that step with
//!   [`state_proof::ProofAssembler`].
//!
//! Both read execution through a [`state_proof::backend::ExecutionBackend`]
//! and share recently built timelines through an
//! [`IndexCache`](index_cache::IndexCache). [`service::connect`] wires them to
//! an L1 node.

pub mod assertion;
pub mod bindings;
pub mod bisection;
pub mod config;
pub mod contracts;
pub mod env;
pub mod events;
pub mod feeds;
pub mod index_cache;
pub mod retry;
pub mod service;
pub mod tracing;
pub mod validator;
