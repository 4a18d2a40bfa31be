//! Virtual-voting consensus over the event DAG.
//!
//! Events are grouped into frames. The first event of a validator in a frame
//! is a root; an event moves one frame past its parents once it
//! forkless-causes roots holding a quorum of stake in the parents' frame.
//! Roots of later frames vote, purely as a function of the DAG, on which roots
//! of an undecided frame are known to a quorum. As soon as the vote settles,
//! the first root (in stake order) with a decided "yes" becomes the frame's
//! atropos, and everything the atropos observes that no earlier atropos did
//! is emitted as a [`DecidedBatch`] in a deterministic order.
//!
//! Replaying the same DAG always yields the same batches, whatever order the
//! events were admitted in.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod batch;
pub use batch::DecidedBatch;

mod election;

mod engine;
pub use engine::{Lachesis, Root};

pub mod ordering;
pub use ordering::median_time;
