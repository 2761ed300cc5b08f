//! Queues and command groups
//!
//! A [`Queue`] is a scoped submission boundary. Each `submit` runs a command
//! group closure against a fresh [`Handler`], which collects the accessor
//! requests and the kernel; the resulting work item is handed to the
//! scheduler and the call returns at once. Releasing or dropping the queue
//! blocks until everything it ever submitted is terminal.

use crate::access::{walk, AccessContext, AccessDescriptor, AccessMode, AccessTarget};
use crate::buffer::LocalAccessor;
use crate::error::{aggregate, DataflowError, DataflowResult, KernelError};
use crate::resource::Resource;
use crate::scheduler::{KernelBody, Request, Scheduler, WorkItemHandle};
use crate::types::ResourceKind;
use parking_lot::Mutex;

/// Command group context passed to [`Queue::submit`]
pub struct Handler {
    scheduler: Scheduler,
    requests: Vec<Request>,
    kernel: Option<(String, KernelBody)>,
}

impl Handler {
    fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            requests: Vec::new(),
            kernel: None,
        }
    }

    /// Record a validated request for the work item being built
    pub(crate) fn register(
        &mut self,
        resource: &impl Resource,
        request: Request,
    ) -> DataflowResult<()> {
        if !resource.scheduler().same_as(&self.scheduler) {
            return Err(DataflowError::ForeignResource);
        }
        self.requests.push(request);
        Ok(())
    }

    /// Run `body` once
    pub fn single_task<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce() -> Result<(), KernelError> + Send + 'static,
    {
        self.set_kernel(name.into(), Box::new(body));
    }

    /// Run `body` for every index of `extent`, last dimension fastest.
    ///
    /// The first failing index stops the walk and fails the work item.
    pub fn parallel_for<F>(&mut self, name: impl Into<String>, extent: &[usize], body: F)
    where
        F: Fn(&[usize]) -> Result<(), KernelError> + Send + 'static,
    {
        let extent = extent.to_vec();
        self.set_kernel(name.into(), Box::new(move || walk(&extent, |index| body(index))));
    }

    /// Zero-initialised scratch memory private to this work item
    pub fn local_scratch<T: Default + Clone>(
        &mut self,
        extent: &[usize],
    ) -> DataflowResult<LocalAccessor<T>> {
        AccessDescriptor::new(AccessMode::ReadWrite, AccessTarget::LocalScratch)
            .validate(ResourceKind::Scratch, AccessContext::Submission)?;
        Ok(LocalAccessor::allocate(extent))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn set_kernel(&mut self, name: String, body: KernelBody) {
        if let Some((previous, _)) = &self.kernel {
            log::warn!("Kernel '{}' replaces '{}' in the same command group", name, previous);
        }
        self.kernel = Some((name, body));
    }
}

/// Ordered submission boundary with drain-on-release
pub struct Queue {
    scheduler: Scheduler,
    submitted: Mutex<Vec<WorkItemHandle>>,
    released: bool,
}

impl Queue {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            submitted: Mutex::new(Vec::new()),
            released: false,
        }
    }

    /// Build one work item from `group` and register it.
    ///
    /// Errors raised while building are returned here and nothing is
    /// registered. Kernel failures only show up at a later wait.
    pub fn submit<F>(&self, group: F) -> DataflowResult<WorkItemHandle>
    where
        F: FnOnce(&mut Handler) -> DataflowResult<()>,
    {
        let mut cgh = Handler::new(self.scheduler.clone());
        group(&mut cgh)?;

        let (name, body) = cgh.kernel.ok_or(DataflowError::EmptyCommandGroup)?;
        let handle = self.scheduler.submit(name, cgh.requests, body);
        self.submitted.lock().push(handle.clone());
        Ok(handle)
    }

    /// Block until every item submitted so far is terminal.
    ///
    /// Failures are reported once; a later wait only covers newer items.
    pub fn wait(&self) -> DataflowResult<()> {
        let handles = std::mem::take(&mut *self.submitted.lock());
        if !handles.is_empty() {
            log::debug!("Waiting for {} work item(s)", handles.len());
        }

        let failures = handles
            .iter()
            .filter_map(|h| h.outcome().err().map(|e| (h.id(), e)))
            .collect();
        aggregate(failures)
    }

    /// Items submitted and not yet waited for
    pub fn pending(&self) -> usize {
        self.submitted.lock().len()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Drain and close the queue
    pub fn release(mut self) -> DataflowResult<()> {
        self.released = true;
        self.wait()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.wait() {
            log::error!("Queue dropped after failures: {}", e);
        }
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::types::WorkItemState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_empty_command_group_is_rejected() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);

        let err = queue.submit(|_| Ok(())).unwrap_err();
        assert_eq!(err, DataflowError::EmptyCommandGroup);
        assert_eq!(scheduler.statistics().total_items, 0);
    }

    #[test]
    fn test_construction_error_registers_nothing() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);
        let buf: Buffer<i32> = Buffer::new(&scheduler, &[4]);

        let err = queue
            .submit(|cgh| {
                buf.access(cgh, AccessMode::Read)?;
                buf.request_range(cgh, AccessDescriptor::global(AccessMode::Write), &[2], &[4])?;
                cgh.single_task("never", || Ok(()));
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, DataflowError::RangeOutOfBounds { .. }));
        assert_eq!(scheduler.outstanding(buf.id()), 0);
        assert_eq!(scheduler.statistics().total_items, 0);
    }

    #[test]
    fn test_foreign_resource_is_rejected() {
        let ours = Scheduler::default();
        let theirs = Scheduler::default();
        let queue = Queue::new(&ours);
        let buf: Buffer<i32> = Buffer::new(&theirs, &[1]);

        let err = queue
            .submit(|cgh| {
                buf.access(cgh, AccessMode::Read)?;
                cgh.single_task("k", || Ok(()));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, DataflowError::ForeignResource);
    }

    #[test]
    fn test_parallel_for_visits_every_index() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);
        let visits = Arc::new(AtomicUsize::new(0));

        let counter = visits.clone();
        let handle = queue
            .submit(|cgh| {
                cgh.parallel_for("count", &[3, 4], move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .unwrap();

        handle.wait().unwrap();
        assert_eq!(visits.load(Ordering::SeqCst), 12);
        assert_eq!(handle.state(), WorkItemState::Done);
    }

    #[test]
    fn test_release_aggregates_failures() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);

        for i in 0..3 {
            queue
                .submit(move |cgh| {
                    cgh.single_task(format!("k{}", i), move || {
                        if i == 1 {
                            Err(KernelError::failed("bad item"))
                        } else {
                            Ok(())
                        }
                    });
                    Ok(())
                })
                .unwrap();
        }

        match queue.release().unwrap_err() {
            DataflowError::ItemsFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].1, KernelError::failed("bad item"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wait_reports_each_failure_once() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);

        queue
            .submit(|cgh| {
                cgh.single_task("fails", || Err(KernelError::failed("once")));
                Ok(())
            })
            .unwrap();

        assert!(queue.wait().is_err());
        assert_eq!(queue.pending(), 0);
        queue.wait().unwrap();
        queue.release().unwrap();
    }

    #[test]
    fn test_local_scratch_is_zeroed() {
        let scheduler = Scheduler::default();
        let queue = Queue::new(&scheduler);

        let handle = queue
            .submit(|cgh| {
                let scratch = cgh.local_scratch::<u32>(&[4])?;
                cgh.single_task("scratch", move || {
                    assert_eq!(scratch.get(&[3])?, 0);
                    scratch.set(&[3], 7)?;
                    assert_eq!(scratch.get(&[3])?, 7);
                    Ok(())
                });
                Ok(())
            })
            .unwrap();
        handle.wait().unwrap();
    }
}
