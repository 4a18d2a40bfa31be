//! A Sonic node.
//!
//! Events from peers and from the local [`emitter`] are admitted into the
//! epoch's DAG and ordered by consensus ([`stages`]). The [`former`] turns
//! decided batches into blocks, executes them and rolls epochs ([`epoch`]);
//! [`certification`] signs and aggregates certificates for every block and
//! committee. Missed events are fetched from peers through [`sync`].
//! [`node_core::NodeCore`] wires these stages together synchronously,
//! [`runtime::Node`] runs them as tokio workers, and [`fakenet::FakeNet`]
//! drives several cores deterministically in one thread.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod certification;
pub mod clock;
pub mod emitter;
pub mod epoch;
pub mod error;
pub mod fakenet;
pub mod former;
pub mod ingress;
pub mod launch;
pub mod network;
pub mod node_core;
pub mod rpc;
pub mod runtime;
pub mod stages;
pub mod store;
pub mod sync;
pub mod txpool;

pub use error::Fatal;
pub use runtime::{Launch, Node};
