//! # Beacon
//!
//! Backend of a Bitcoin-based assurance-contract crowdfunding tool. A
//! *project* describes a goal transaction; a *pledge* is a partial,
//! off-chain signed contribution toward it, signed so that further inputs
//! and outputs can be appended. When enough pledges exist, anyone can
//! assemble and broadcast the claim transaction.
//!
//! The crate's core is the pledge lifecycle and verification engine: a
//! single-threaded actor that combines a local wallet, a watched on-disk
//! directory, and either a remote project server or the Bitcoin P2P
//! network into an observable, consistent view of each project's open and
//! claimed pledges.
//!
//! ## Modules
//! - [`model`]: projects, pledges, transactions, states.
//! - [`scheduler`]: the engine thread.
//! - [`store`]: observable pledge sets and check statuses.
//! - [`verifier`]: stateless pledge validation.
//! - [`networking`]: peer seam and the replicated UTXO query round.
//! - [`server_client`]: project-server status fetches.
//! - [`claims`]: claim-transaction recognition and state transitions.
//! - [`wallet`] / [`disk`]: collaborator seams (wallet, watched
//!   directories) plus the directory-backed disk layer.
//! - [`backend`]: the orchestrator tying it all together.
//! - [`api`]: server-mode REST surface.

pub mod api;
pub mod backend;
pub mod claims;
pub mod configuration;
pub mod disk;
pub mod error;
pub mod handlers;
pub mod model;
pub mod networking;
pub mod scheduler;
pub mod server_client;
pub mod store;
pub mod verifier;
pub mod wallet;

pub use crate::backend::Backend;
pub use crate::configuration::{Config, Mode};
