//! Scheduler - Dependency ordering for accessor-driven work items
//!
//! Owns the map from resource identity to the grants currently held against
//! it. A submitted work item waits for every earlier item holding a
//! conflicting grant on an overlapping region, then runs on its own worker
//! thread. Completion (success or failure) always removes the item's grants
//! and wakes whoever depends on them.

use crate::access::{AccessDescriptor, Region};
use crate::error::{aggregate, DataflowError, DataflowResult, KernelError};
use crate::types::{
    IdSequence, ResourceId, RuntimeConfig, SchedulerStatistics, WorkItemId, WorkItemState,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Opaque kernel body, invoked once with its accessors already captured
pub type KernelBody = Box<dyn FnOnce() -> Result<(), KernelError> + Send + 'static>;

/// One validated access a work item makes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub resource: ResourceId,
    pub descriptor: AccessDescriptor,
    pub region: Region,
}

/// Handle to the dependency scheduler.
///
/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: RuntimeConfig,
    ids: IdSequence,
    state: Mutex<SchedulerState>,
    /// Signalled whenever an item becomes ready or terminal
    changed: Condvar,
    stats: SchedulerStats,
}

#[derive(Default)]
struct SchedulerStats {
    total_items: AtomicU64,
    completed_items: AtomicU64,
    failed_items: AtomicU64,
}

#[derive(Default)]
struct SchedulerState {
    resources: HashMap<ResourceId, ResourceEntry>,
    items: HashMap<WorkItemId, ItemRecord>,
    ready: VecDeque<WorkItemId>,
    running: usize,
}

#[derive(Default)]
struct ResourceEntry {
    outstanding: Vec<Grant>,
    /// Failures of items that touched this resource, reported on release
    failures: Vec<(WorkItemId, KernelError)>,
}

#[derive(Debug, Clone)]
struct Grant {
    item: WorkItemId,
    descriptor: AccessDescriptor,
    region: Region,
}

struct ItemRecord {
    name: String,
    state: WorkItemState,
    /// Unfinished conflicting predecessors
    blockers: usize,
    dependents: Vec<WorkItemId>,
    resources: Vec<ResourceId>,
    /// `None` for host leases, and for kernels once launched
    body: Option<KernelBody>,
    is_kernel: bool,
    submitted_at: Instant,
    completion: Arc<Completion>,
}

struct Launch {
    id: WorkItemId,
    name: String,
    body: KernelBody,
}

impl SchedulerState {
    /// Record the grants of `id` and wire it behind every conflicting
    /// outstanding grant. Returns the number of distinct predecessors.
    fn register(&mut self, id: WorkItemId, requests: &[Request]) -> usize {
        let mut predecessors = HashSet::new();

        for request in requests {
            let entry = self.resources.entry(request.resource).or_default();
            for grant in &entry.outstanding {
                if grant.item != id
                    && grant.descriptor.conflicts_with(&request.descriptor)
                    && grant.region.overlaps(&request.region)
                {
                    predecessors.insert(grant.item);
                }
            }
            entry.outstanding.push(Grant {
                item: id,
                descriptor: request.descriptor,
                region: request.region.clone(),
            });
        }

        for pred in &predecessors {
            if let Some(record) = self.items.get_mut(pred) {
                record.dependents.push(id);
            }
        }

        predecessors.len()
    }

    fn mark_ready(&mut self, id: WorkItemId) {
        let Some(record) = self.items.get_mut(&id) else {
            return;
        };
        record.state = WorkItemState::Ready;
        // Host leases are picked up by the thread waiting on them
        if record.is_kernel {
            self.ready.push_back(id);
        }
    }

    fn take_launchable(&mut self, limit: usize) -> Vec<Launch> {
        let mut launches = Vec::new();

        while limit == 0 || self.running < limit {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let Some(record) = self.items.get_mut(&id) else {
                continue;
            };
            let Some(body) = record.body.take() else {
                continue;
            };
            record.state = WorkItemState::Running;
            self.running += 1;
            launches.push(Launch {
                id,
                name: record.name.clone(),
                body,
            });
        }

        launches
    }
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        log::info!(
            "Initializing dataflow scheduler (max running items: {})",
            if config.max_running_items == 0 {
                "unbounded".to_string()
            } else {
                config.max_running_items.to_string()
            }
        );

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                ids: IdSequence::default(),
                state: Mutex::new(SchedulerState::default()),
                changed: Condvar::new(),
                stats: SchedulerStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// True when both handles drive the same scheduler
    pub fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a work item and return immediately.
    ///
    /// The body runs once every earlier conflicting grant on the requested
    /// resources has been released.
    pub fn submit(
        &self,
        name: impl Into<String>,
        requests: Vec<Request>,
        body: KernelBody,
    ) -> WorkItemHandle {
        let name = name.into();
        let completion = Arc::new(Completion::default());

        let (id, launches) = {
            let mut state = self.inner.state.lock();
            // Allocated under the lock so ids follow registration order
            let id = self.inner.ids.next();
            let blockers = state.register(id, &requests);

            state.items.insert(
                id,
                ItemRecord {
                    name: name.clone(),
                    state: WorkItemState::Pending,
                    blockers,
                    dependents: Vec::new(),
                    resources: distinct_resources(&requests),
                    body: Some(body),
                    is_kernel: true,
                    submitted_at: Instant::now(),
                    completion: completion.clone(),
                },
            );
            self.inner.stats.total_items.fetch_add(1, Ordering::Relaxed);

            log::debug!(
                "Submitted work item {} '{}' ({} requests, {} blockers)",
                id,
                name,
                requests.len(),
                blockers
            );

            if blockers == 0 {
                state.mark_ready(id);
            }
            (id, state.take_launchable(self.inner.config.max_running_items))
        };

        self.launch(launches);

        WorkItemHandle {
            id,
            completion,
            scheduler: self.clone(),
        }
    }

    /// Take a host-side grant, blocking until no earlier conflicting work
    /// item is outstanding. The grant lasts until the lease is dropped.
    pub(crate) fn acquire_host(&self, request: Request) -> HostLease {
        let mut state = self.inner.state.lock();
        let id = self.inner.ids.next();
        let blockers = state.register(id, std::slice::from_ref(&request));

        state.items.insert(
            id,
            ItemRecord {
                name: "host".to_string(),
                state: WorkItemState::Pending,
                blockers,
                dependents: Vec::new(),
                resources: vec![request.resource],
                body: None,
                is_kernel: false,
                submitted_at: Instant::now(),
                completion: Arc::new(Completion::default()),
            },
        );

        if blockers == 0 {
            state.mark_ready(id);
        } else {
            log::debug!(
                "Host access {} on {} waits for {} work item(s)",
                id,
                request.resource,
                blockers
            );
        }

        while state
            .items
            .get(&id)
            .is_some_and(|r| r.state == WorkItemState::Pending)
        {
            self.inner.changed.wait(&mut state);
        }
        if let Some(record) = state.items.get_mut(&id) {
            record.state = WorkItemState::Running;
        }

        HostLease {
            scheduler: self.clone(),
            id,
        }
    }

    /// Block until no grant is outstanding on `resource`, then forget it.
    ///
    /// Reports every failure recorded by work items that touched the
    /// resource since it was last drained.
    pub fn drain_resource(&self, resource: ResourceId) -> DataflowResult<()> {
        let mut state = self.inner.state.lock();

        let pending = state
            .resources
            .get(&resource)
            .map_or(0, |e| e.outstanding.len());
        if pending > 0 {
            log::debug!("Draining resource {} ({} outstanding)", resource, pending);
        }

        while state
            .resources
            .get(&resource)
            .is_some_and(|e| !e.outstanding.is_empty())
        {
            self.inner.changed.wait(&mut state);
        }

        let failures = state
            .resources
            .remove(&resource)
            .map(|e| e.failures)
            .unwrap_or_default();
        aggregate(failures)
    }

    /// Number of grants currently held against `resource`
    pub fn outstanding(&self, resource: ResourceId) -> usize {
        self.inner
            .state
            .lock()
            .resources
            .get(&resource)
            .map_or(0, |e| e.outstanding.len())
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let state = self.inner.state.lock();
        let pending_items = state
            .items
            .values()
            .filter(|r| {
                r.is_kernel && matches!(r.state, WorkItemState::Pending | WorkItemState::Ready)
            })
            .count() as u64;

        SchedulerStatistics {
            total_items: self.inner.stats.total_items.load(Ordering::Relaxed),
            completed_items: self.inner.stats.completed_items.load(Ordering::Relaxed),
            failed_items: self.inner.stats.failed_items.load(Ordering::Relaxed),
            pending_items,
            running_items: state.running as u64,
            tracked_resources: state.resources.len(),
        }
    }

    fn item_state(&self, id: WorkItemId, completion: &Completion) -> WorkItemState {
        let state = self.inner.state.lock();
        if let Some(record) = state.items.get(&id) {
            return record.state;
        }
        // Outcomes are published before the record is dropped
        match completion.outcome() {
            Some(Err(_)) => WorkItemState::Failed,
            _ => WorkItemState::Done,
        }
    }

    fn launch(&self, launches: Vec<Launch>) {
        for Launch { id, name, body } in launches {
            let scheduler = self.clone();
            let thread_name = format!("{}-{}", self.inner.config.thread_name_prefix, id.0);

            let spawned = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || scheduler.run(id, &name, body));

            if let Err(e) = spawned {
                log::error!("Failed to start worker for work item {}: {}", id, e);
                self.finish(id, Err(KernelError::Spawn(e.to_string())));
            }
        }
    }

    fn run(&self, id: WorkItemId, name: &str, body: KernelBody) {
        let level = if self.inner.config.trace_kernels {
            log::Level::Info
        } else {
            log::Level::Trace
        };

        log::log!(level, "Kernel started: {} '{}'", id, name);
        let start = Instant::now();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(KernelError::Panicked(panic_message(payload.as_ref()))),
        };

        log::log!(
            level,
            "Kernel stopped: {} '{}' after {:.2}ms",
            id,
            name,
            start.elapsed().as_secs_f64() * 1000.0
        );

        self.finish(id, outcome);
    }

    /// Move an item to its terminal state and release everything it held
    fn finish(&self, id: WorkItemId, outcome: Result<(), KernelError>) {
        let launches = {
            let mut state = self.inner.state.lock();
            let Some(record) = state.items.remove(&id) else {
                return;
            };

            if record.is_kernel && record.state == WorkItemState::Running {
                state.running -= 1;
            }

            for resource in &record.resources {
                if let Some(entry) = state.resources.get_mut(resource) {
                    entry.outstanding.retain(|g| g.item != id);
                    if let Err(e) = &outcome {
                        entry.failures.push((id, e.clone()));
                    }
                }
            }

            let mut unblocked = Vec::new();
            for dep in &record.dependents {
                if let Some(waiting) = state.items.get_mut(dep) {
                    waiting.blockers = waiting.blockers.saturating_sub(1);
                    if waiting.blockers == 0 && waiting.state == WorkItemState::Pending {
                        unblocked.push(*dep);
                    }
                }
            }
            // Keep submission order among items released together
            unblocked.sort();
            for dep in unblocked {
                state.mark_ready(dep);
            }

            if record.is_kernel {
                match &outcome {
                    Ok(()) => {
                        self.inner.stats.completed_items.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "Work item {} '{}' done ({:.2}ms since submission)",
                            id,
                            record.name,
                            record.submitted_at.elapsed().as_secs_f64() * 1000.0
                        );
                    }
                    Err(e) => {
                        self.inner.stats.failed_items.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Work item {} '{}' failed: {}", id, record.name, e);
                    }
                }
            }

            record.completion.publish(outcome);
            state.take_launchable(self.inner.config.max_running_items)
        };

        self.inner.changed.notify_all();
        self.launch(launches);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn distinct_resources(requests: &[Request]) -> Vec<ResourceId> {
    let mut seen = HashSet::new();
    requests
        .iter()
        .map(|r| r.resource)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Terminal outcome of one work item, shared with its waiters
#[derive(Default)]
pub(crate) struct Completion {
    outcome: Mutex<Option<Result<(), KernelError>>>,
    done: Condvar,
}

impl Completion {
    fn publish(&self, outcome: Result<(), KernelError>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn outcome(&self) -> Option<Result<(), KernelError>> {
        self.outcome.lock().clone()
    }

    pub(crate) fn wait(&self) -> Result<(), KernelError> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// Returned by a submission; lets the caller wait for that one item
#[derive(Clone)]
pub struct WorkItemHandle {
    id: WorkItemId,
    completion: Arc<Completion>,
    scheduler: Scheduler,
}

impl WorkItemHandle {
    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn state(&self) -> WorkItemState {
        self.scheduler.item_state(self.id, &self.completion)
    }

    /// Block until the item is terminal and surface its failure, if any
    pub fn wait(&self) -> DataflowResult<()> {
        self.completion
            .wait()
            .map_err(|source| DataflowError::Kernel { id: self.id, source })
    }

    pub(crate) fn outcome(&self) -> Result<(), KernelError> {
        self.completion.wait()
    }
}

impl std::fmt::Debug for WorkItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItemHandle").field("id", &self.id).finish()
    }
}

/// Host-side grant; releases on drop
pub(crate) struct HostLease {
    scheduler: Scheduler,
    id: WorkItemId,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.scheduler.finish(self.id, Ok(()));
    }
}
