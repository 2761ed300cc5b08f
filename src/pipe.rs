//! Pipes - bounded FIFO channels between work items
//!
//! A pipe is a ring of `capacity` slots. Every accessor picks its own policy:
//!
//! - **non-blocking**: `write`/`read` return `false`/`None` when the ring is
//!   full/empty and the caller retries; `reserve(n)` claims `n` slots or
//!   elements all-or-nothing and fails with `ReservationUnavailable` otherwise.
//! - **blocking**: the same calls wait on the pipe's condition variable until
//!   they can complete.
//!
//! A pending write reservation holds its place in FIFO order: readers never
//! see elements written after it until it is committed or aborted.
//!
//! Capacity is a caller contract. A blocking producer that must push more
//! elements than `capacity` before its consumer can start (for example when
//! the consumer sits on a queue released after the producer's) waits forever.
//! This is not detected.

use crate::access::{AccessContext, AccessDescriptor, AccessMode, AccessTarget, Region};
use crate::error::{DataflowError, DataflowResult};
use crate::queue::Handler;
use crate::resource::{ReleaseGuard, Resource};
use crate::scheduler::{Request, Scheduler};
use crate::types::{ResourceId, ResourceKind};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

enum Slot<T> {
    Free,
    /// Claimed by a write reservation that has not committed yet
    Claimed,
    Ready(T),
    /// Claimed by a read reservation, kept until it commits
    Taken(T),
    /// Consumed, waiting for the head to pass
    Released,
    /// Aborted write slot that never carried an element
    Skipped,
}

impl<T> Slot<T> {
    fn is_spent(&self) -> bool {
        matches!(self, Slot::Released | Slot::Skipped)
    }
}

/// Slot store; every slot outside `[head, head + len)` is `Free`
struct Ring<T> {
    slots: Vec<Slot<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn position(&self, i: usize) -> usize {
        (self.head + i) % self.capacity()
    }

    fn tail(&self) -> usize {
        self.position(self.len)
    }

    fn push(&mut self, value: T) -> Result<(), T> {
        if self.free() == 0 {
            return Err(value);
        }
        let tail = self.tail();
        self.slots[tail] = Slot::Ready(value);
        self.len += 1;
        Ok(())
    }

    /// Positions of readable elements, oldest first, stopping at the first
    /// uncommitted write claim
    fn readable(&self, limit: usize) -> Vec<usize> {
        let mut found = Vec::new();
        for i in 0..self.len {
            if found.len() == limit {
                break;
            }
            let pos = self.position(i);
            match self.slots[pos] {
                Slot::Ready(_) => found.push(pos),
                Slot::Claimed => break,
                _ => {}
            }
        }
        found
    }

    fn pop(&mut self) -> Option<T> {
        let pos = *self.readable(1).first()?;
        match std::mem::replace(&mut self.slots[pos], Slot::Released) {
            Slot::Ready(value) => {
                self.reclaim();
                Some(value)
            }
            other => {
                self.slots[pos] = other;
                None
            }
        }
    }

    fn claim_write(&mut self, n: usize) -> Option<Vec<usize>> {
        if n == 0 || n > self.free() {
            return None;
        }
        let positions: Vec<usize> = (0..n).map(|i| self.position(self.len + i)).collect();
        for &pos in &positions {
            self.slots[pos] = Slot::Claimed;
        }
        self.len += n;
        Some(positions)
    }

    fn claim_read(&mut self, n: usize) -> Option<Vec<usize>> {
        if n == 0 {
            return None;
        }
        let positions = self.readable(n);
        if positions.len() < n {
            return None;
        }
        for &pos in &positions {
            if let Slot::Ready(value) = std::mem::replace(&mut self.slots[pos], Slot::Free) {
                self.slots[pos] = Slot::Taken(value);
            }
        }
        Some(positions)
    }

    fn commit_write(&mut self, positions: &[usize], values: Vec<Option<T>>) {
        for (&pos, value) in positions.iter().zip(values) {
            self.slots[pos] = match value {
                Some(v) => Slot::Ready(v),
                None => Slot::Skipped,
            };
        }
        self.reclaim();
    }

    fn abort_write(&mut self, positions: &[usize]) {
        let Some(&last) = positions.last() else {
            return;
        };
        // Newest claim: hand the slots straight back
        if (last + 1) % self.capacity() == self.tail() {
            for &pos in positions {
                self.slots[pos] = Slot::Free;
            }
            self.len -= positions.len();
        } else {
            for &pos in positions {
                self.slots[pos] = Slot::Skipped;
            }
        }
        self.reclaim();
    }

    fn peek(&self, pos: usize) -> Option<&T> {
        match &self.slots[pos] {
            Slot::Taken(value) => Some(value),
            _ => None,
        }
    }

    fn commit_read(&mut self, positions: &[usize]) {
        for &pos in positions {
            self.slots[pos] = Slot::Released;
        }
        self.reclaim();
    }

    /// Claimed elements become readable again, ahead of anything newer
    fn abort_read(&mut self, positions: &[usize]) {
        for &pos in positions {
            self.slots[pos] = match std::mem::replace(&mut self.slots[pos], Slot::Free) {
                Slot::Taken(value) => Slot::Ready(value),
                _ => Slot::Released,
            };
        }
        self.reclaim();
    }

    fn reclaim(&mut self) {
        while self.len > 0 && self.slots[self.head].is_spent() {
            self.slots[self.head] = Slot::Free;
            self.head = (self.head + 1) % self.capacity();
            self.len -= 1;
        }
    }
}

struct PipeShared<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    changed: Condvar,
}

impl<T> PipeShared<T> {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            ring: Mutex::new(Ring::new(capacity)),
            changed: Condvar::new(),
        })
    }

    fn write(&self, mut value: T, blocking: bool) -> bool {
        let mut ring = self.ring.lock();
        loop {
            match ring.push(value) {
                Ok(()) => {
                    drop(ring);
                    self.changed.notify_all();
                    return true;
                }
                Err(rejected) if blocking => {
                    value = rejected;
                    self.changed.wait(&mut ring);
                }
                Err(_) => return false,
            }
        }
    }

    fn read(&self, blocking: bool) -> Option<T> {
        let mut ring = self.ring.lock();
        loop {
            if let Some(value) = ring.pop() {
                drop(ring);
                self.changed.notify_all();
                return Some(value);
            }
            if !blocking {
                return None;
            }
            self.changed.wait(&mut ring);
        }
    }

    /// Shared claim loop for both reservation directions
    fn claim(
        &self,
        n: usize,
        blocking: bool,
        claim: impl Fn(&mut Ring<T>, usize) -> Option<Vec<usize>>,
        available: impl Fn(&Ring<T>) -> usize,
    ) -> DataflowResult<Vec<usize>> {
        let mut ring = self.ring.lock();
        if n == 0 || n > self.capacity {
            return Err(DataflowError::ReservationUnavailable {
                requested: n,
                available: available(&*ring),
            });
        }
        loop {
            if let Some(positions) = claim(&mut *ring, n) {
                drop(ring);
                self.changed.notify_all();
                return Ok(positions);
            }
            if !blocking {
                return Err(DataflowError::ReservationUnavailable {
                    requested: n,
                    available: available(&*ring),
                });
            }
            self.changed.wait(&mut ring);
        }
    }

    fn update(&self, f: impl FnOnce(&mut Ring<T>)) {
        f(&mut *self.ring.lock());
        self.changed.notify_all();
    }
}

/// Shared handle to a pipe of `T`
pub struct Pipe<T> {
    shared: Arc<PipeShared<T>>,
    guard: Arc<ReleaseGuard>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<T: Send + 'static> Pipe<T> {
    /// Pipe able to hold `capacity` in-flight elements.
    ///
    /// A zero capacity pipe can never transfer anything.
    pub fn new(scheduler: &Scheduler, capacity: usize) -> Self {
        Self {
            shared: PipeShared::new(capacity),
            guard: ReleaseGuard::new(scheduler, ResourceKind::Pipe),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Occupied slots, including claimed ones
    pub fn len(&self) -> usize {
        self.shared.ring.lock().len
    }

    pub fn free(&self) -> usize {
        self.shared.ring.lock().free()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Request a pipe endpoint inside a command group
    pub fn request_access(
        &self,
        cgh: &mut Handler,
        descriptor: AccessDescriptor,
    ) -> DataflowResult<PipeAccessor<T>> {
        self.grant(cgh, descriptor)?;
        let blocking = descriptor.target == AccessTarget::PipeBlocking;

        Ok(match descriptor.mode {
            AccessMode::Write => PipeAccessor::Writer(PipeWriter {
                shared: self.shared.clone(),
                blocking,
            }),
            _ => PipeAccessor::Reader(PipeReader {
                shared: self.shared.clone(),
                blocking,
            }),
        })
    }

    /// Producer endpoint with the policy given by `target`
    pub fn writer(
        &self,
        cgh: &mut Handler,
        target: AccessTarget,
    ) -> DataflowResult<PipeWriter<T>> {
        self.grant(cgh, AccessDescriptor::new(AccessMode::Write, target))?;
        Ok(PipeWriter {
            shared: self.shared.clone(),
            blocking: target == AccessTarget::PipeBlocking,
        })
    }

    /// Consumer endpoint with the policy given by `target`
    pub fn reader(
        &self,
        cgh: &mut Handler,
        target: AccessTarget,
    ) -> DataflowResult<PipeReader<T>> {
        self.grant(cgh, AccessDescriptor::new(AccessMode::Read, target))?;
        Ok(PipeReader {
            shared: self.shared.clone(),
            blocking: target == AccessTarget::PipeBlocking,
        })
    }

    fn grant(&self, cgh: &mut Handler, descriptor: AccessDescriptor) -> DataflowResult<()> {
        descriptor.validate(ResourceKind::Pipe, AccessContext::Submission)?;
        cgh.register(
            self,
            Request {
                resource: self.id(),
                descriptor,
                region: Region::whole(&[self.shared.capacity]),
            },
        )
    }

    /// Give up this handle; the last one waits for every work item holding
    /// an endpoint
    pub fn release(self) -> DataflowResult<()> {
        ReleaseGuard::release(self.guard)
    }
}

impl<T> Resource for Pipe<T> {
    fn id(&self) -> ResourceId {
        self.guard.id()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Pipe
    }

    fn scheduler(&self) -> &Scheduler {
        self.guard.scheduler()
    }
}

impl<T> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.guard.id())
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// Either end of a pipe, as returned by [`Pipe::request_access`]
pub enum PipeAccessor<T> {
    Writer(PipeWriter<T>),
    Reader(PipeReader<T>),
}

pub struct PipeWriter<T> {
    shared: Arc<PipeShared<T>>,
    blocking: bool,
}

impl<T> Clone for PipeWriter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            blocking: self.blocking,
        }
    }
}

impl<T> PipeWriter<T> {
    /// Push one element. Non-blocking endpoints return `false` when the
    /// pipe is full; blocking ones wait for room and always return `true`.
    pub fn write(&self, value: T) -> bool {
        self.shared.write(value, self.blocking)
    }

    /// Claim `n` free slots at the end of the pipe, all or nothing
    pub fn reserve(&self, n: usize) -> DataflowResult<WriteReservation<T>> {
        let positions = self.shared.claim(n, self.blocking, Ring::claim_write, Ring::free)?;
        log::trace!("Reserved {} pipe slot(s) for writing", n);
        Ok(WriteReservation {
            shared: self.shared.clone(),
            values: (0..positions.len()).map(|_| None).collect(),
            positions,
            released: false,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

pub struct PipeReader<T> {
    shared: Arc<PipeShared<T>>,
    blocking: bool,
}

impl<T> Clone for PipeReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            blocking: self.blocking,
        }
    }
}

impl<T> PipeReader<T> {
    /// Pop the oldest element. Non-blocking endpoints return `None` when
    /// nothing is readable; blocking ones wait for an element.
    pub fn read(&self) -> Option<T> {
        self.shared.read(self.blocking)
    }

    /// Claim the `n` oldest readable elements, all or nothing
    pub fn reserve(&self, n: usize) -> DataflowResult<ReadReservation<T>> {
        let positions = self.shared.claim(n, self.blocking, Ring::claim_read, |ring| {
            ring.readable(ring.capacity()).len()
        })?;
        log::trace!("Reserved {} pipe element(s) for reading", n);
        Ok(ReadReservation {
            shared: self.shared.clone(),
            positions,
            released: false,
        })
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Claimed block of free slots.
///
/// Dropping it without [`abort`](Self::abort) commits it.
pub struct WriteReservation<T> {
    shared: Arc<PipeShared<T>>,
    positions: Vec<usize>,
    values: Vec<Option<T>>,
    released: bool,
}

impl<T> WriteReservation<T> {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Fill slot `index` of the claim; visible to readers once committed
    pub fn write(&mut self, index: usize, value: T) -> DataflowResult<()> {
        let len = self.len();
        let slot = self
            .values
            .get_mut(index)
            .ok_or_else(|| DataflowError::IndexOutOfBounds {
                index: vec![index],
                range: vec![len],
            })?;
        *slot = Some(value);
        Ok(())
    }

    /// Publish the written slots; unwritten ones are skipped by readers
    pub fn commit(mut self) {
        self.finish(true);
    }

    /// Give the slots back without publishing anything
    pub fn abort(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, commit: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let values = std::mem::take(&mut self.values);
        let positions = &self.positions;
        self.shared.update(|ring| {
            if commit {
                ring.commit_write(positions, values);
            } else {
                ring.abort_write(positions);
            }
        });
    }
}

impl<T> Drop for WriteReservation<T> {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Claimed block of readable elements.
///
/// Dropping it without [`abort`](Self::abort) commits it.
pub struct ReadReservation<T> {
    shared: Arc<PipeShared<T>>,
    positions: Vec<usize>,
    released: bool,
}

impl<T: Clone> ReadReservation<T> {
    /// Element `index` of the claim, or `None` if out of range.
    ///
    /// The element stays in the pipe until the reservation commits.
    pub fn read(&self, index: usize) -> Option<T> {
        let pos = *self.positions.get(index)?;
        self.shared.ring.lock().peek(pos).cloned()
    }
}

impl<T> ReadReservation<T> {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Free the claimed slots
    pub fn commit(mut self) {
        self.finish(true);
    }

    /// Put every claimed element back in the pipe, unchanged and in order
    pub fn abort(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, commit: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let positions = &self.positions;
        self.shared.update(|ring| {
            if commit {
                ring.commit_read(positions);
            } else {
                ring.abort_read(positions);
            }
        });
    }
}

impl<T> Drop for ReadReservation<T> {
    fn drop(&mut self) {
        self.finish(true);
    }
}
