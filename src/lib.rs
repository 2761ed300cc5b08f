//! # RayOS Dataflow - accessor-driven kernel scheduling
//!
//! Kernels declare how they touch shared data through access descriptors;
//! the scheduler turns those declarations into a dependency graph and runs
//! each work item once everything it conflicts with has finished.
//!
//! ## Architecture
//!
//! - **Access**: descriptors (mode + target) and the conflict rule
//! - **Scheduler**: outstanding grants per resource, work item states, workers
//! - **Buffer**: shared n-dimensional storage with kernel and host accessors
//! - **Pipe**: bounded FIFO with blocking and non-blocking endpoints and
//!   all-or-nothing reservations
//! - **Queue**: scoped submission boundary that drains on release
//!
//! ## Example
//!
//! ```no_run
//! use rayos_dataflow::{AccessMode, Buffer, Queue, RuntimeConfig, Scheduler};
//!
//! fn main() -> anyhow::Result<()> {
//!     let scheduler = Scheduler::new(RuntimeConfig::default());
//!     let data = Buffer::from_vec(&scheduler, &[4], vec![1, 2, 3, 4])?;
//!
//!     let queue = Queue::new(&scheduler);
//!     queue.submit(|cgh| {
//!         let acc = data.access(cgh, AccessMode::ReadWrite)?;
//!         cgh.parallel_for("double", &[4], move |i| {
//!             acc.set(i, acc.get(i)? * 2)?;
//!             Ok(())
//!         });
//!         Ok(())
//!     })?;
//!     queue.release()?;
//!
//!     let host = data.host_access(AccessMode::Read)?;
//!     assert_eq!(host.to_vec()?, vec![2, 4, 6, 8]);
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod buffer;
pub mod error;
pub mod pipe;
pub mod queue;
pub mod resource;
pub mod scheduler;
pub mod types;

pub use access::{AccessContext, AccessDescriptor, AccessMode, AccessTarget, Region};
pub use buffer::{Buffer, BufferAccessor, HostAccessor, LocalAccessor};
pub use error::{DataflowError, DataflowResult, KernelError};
pub use pipe::{Pipe, PipeAccessor, PipeReader, PipeWriter, ReadReservation, WriteReservation};
pub use queue::{Handler, Queue};
pub use resource::Resource;
pub use scheduler::{KernelBody, Request, Scheduler, WorkItemHandle};
pub use types::*;
