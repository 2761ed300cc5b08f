//! Resource identity and scoped release.
//!
//! Buffers and pipes carry nothing scheduling-related besides their id; the
//! outstanding grants live in the [`Scheduler`]. What a resource does own is
//! a [`ReleaseGuard`], shared by all of its external handles, that drains the
//! scheduler exactly once when the last handle goes away.

use crate::error::DataflowResult;
use crate::scheduler::Scheduler;
use crate::types::{ResourceId, ResourceKind};
use std::sync::Arc;

/// Something accessors can be requested against
pub trait Resource {
    fn id(&self) -> ResourceId;
    fn kind(&self) -> ResourceKind;
    /// Scheduler that tracks this resource's grants
    fn scheduler(&self) -> &Scheduler;
}

pub(crate) struct ReleaseGuard {
    scheduler: Scheduler,
    id: ResourceId,
    kind: ResourceKind,
    released: bool,
}

impl ReleaseGuard {
    pub(crate) fn new(scheduler: &Scheduler, kind: ResourceKind) -> Arc<Self> {
        let id = ResourceId::new();
        log::debug!("Created {:?} {}", kind, id);
        Arc::new(Self {
            scheduler: scheduler.clone(),
            id,
            kind,
            released: false,
        })
    }

    pub(crate) fn id(&self) -> ResourceId {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Drain if `guard` is the last external handle, otherwise just drop it
    pub(crate) fn release(guard: Arc<Self>) -> DataflowResult<()> {
        match Arc::try_unwrap(guard) {
            Ok(mut last) => {
                last.released = true;
                log::debug!("Releasing {:?} {}", last.kind, last.id);
                last.scheduler.drain_resource(last.id)
            }
            Err(_) => Ok(()),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.scheduler.drain_resource(self.id) {
            log::error!("{:?} {} dropped after failures: {}", self.kind, self.id, e);
        }
    }
}
