//! The event DAG of the current epoch.
//!
//! Events arrive from peers or from the local emitter and go through
//! [`EventProcessor::process`], which runs the admission checks in order:
//! size and gas ceilings, epoch, creator, parent structure, signature, parent
//! presence, lamport/sequence/time monotonicity, equivocation and finally gas
//! power. Events whose parents are not known yet wait in the [`HangingBuffer`]
//! and are retried as soon as the missing parents are admitted.
//!
//! Admitted events live in a [`Dag`]: an arena indexed by dense [`EventIdx`]
//! that also maintains the [`VectorClock`] used by virtual voting. Every
//! admitted event is persisted in the `lachesis-<epoch>` table, from which the
//! DAG is rebuilt on restart.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod arena;
pub use arena::{Dag, DagEvent, EventIdx};

mod context;
pub use context::EpochContext;

mod error;
pub use error::{AdmissionError, RejectKind};

pub mod gas_power;
pub use gas_power::{GasPower, GasPowerLeft, event_gas};

mod hanging;
pub use hanging::HangingBuffer;

mod processor;
pub use processor::{Admitted, EventProcessor};

pub mod store;
pub use store::{DagStore, EpochEvents};

mod vecclock;
pub use vecclock::VectorClock;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
