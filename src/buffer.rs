//! Buffers and their accessors.
//!
//! A [`Buffer`] is a fixed-shape, row-major region of elements shared by
//! every work item that holds an accessor to it. Accessors are the only way
//! kernels touch the data; the scheduler guarantees that conflicting
//! accessors are never live in two running items at once, so the per-buffer
//! lock below is uncontended in practice.

use crate::access::{walk, AccessContext, AccessDescriptor, AccessMode, AccessTarget, Region};
use crate::error::{DataflowError, DataflowResult};
use crate::queue::Handler;
use crate::resource::{ReleaseGuard, Resource};
use crate::scheduler::{HostLease, Request, Scheduler};
use crate::types::{ResourceId, ResourceKind};
use parking_lot::RwLock;
use std::sync::Arc;

struct BufferStorage<T> {
    extent: Vec<usize>,
    data: RwLock<Vec<T>>,
}

/// Shared handle to a buffer.
///
/// Cloning shares the storage. When the last handle is dropped (or
/// [`Buffer::release`]d) the caller blocks until every work item holding an
/// accessor to it has finished. Move accessors into kernels, never the
/// buffer itself, or the drain would wait on its own kernel.
pub struct Buffer<T> {
    storage: Arc<BufferStorage<T>>,
    guard: Arc<ReleaseGuard>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Buffer<T> {
    /// Default-initialised buffer of `extent`
    pub fn new(scheduler: &Scheduler, extent: &[usize]) -> Self
    where
        T: Default + Clone,
    {
        let len = extent.iter().product();
        Self::with_storage(scheduler, extent, vec![T::default(); len])
    }

    /// Buffer owning `data`, laid out row-major over `extent`
    pub fn from_vec(scheduler: &Scheduler, extent: &[usize], data: Vec<T>) -> DataflowResult<Self> {
        let expected: usize = extent.iter().product();
        if data.len() != expected {
            return Err(DataflowError::ExtentMismatch {
                extent: extent.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::with_storage(scheduler, extent, data))
    }

    fn with_storage(scheduler: &Scheduler, extent: &[usize], data: Vec<T>) -> Self {
        Self {
            storage: Arc::new(BufferStorage {
                extent: extent.to_vec(),
                data: RwLock::new(data),
            }),
            guard: ReleaseGuard::new(scheduler, ResourceKind::Buffer),
        }
    }

    pub fn extent(&self) -> &[usize] {
        &self.storage.extent
    }

    pub fn len(&self) -> usize {
        self.storage.extent.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kernel accessor on global memory covering the whole buffer
    pub fn access(&self, cgh: &mut Handler, mode: AccessMode) -> DataflowResult<BufferAccessor<T>> {
        self.request_access(cgh, AccessDescriptor::global(mode))
    }

    /// Kernel accessor covering the whole buffer
    pub fn request_access(
        &self,
        cgh: &mut Handler,
        descriptor: AccessDescriptor,
    ) -> DataflowResult<BufferAccessor<T>> {
        let region = Region::whole(&self.storage.extent);
        self.grant(cgh, descriptor, region)
    }

    /// Kernel accessor limited to `[offset, offset + range)` in every
    /// dimension. Other parts of the buffer stay available to other items.
    pub fn request_range(
        &self,
        cgh: &mut Handler,
        descriptor: AccessDescriptor,
        offset: &[usize],
        range: &[usize],
    ) -> DataflowResult<BufferAccessor<T>> {
        let region = Region::within(&self.storage.extent, offset, range)?;
        self.grant(cgh, descriptor, region)
    }

    fn grant(
        &self,
        cgh: &mut Handler,
        descriptor: AccessDescriptor,
        region: Region,
    ) -> DataflowResult<BufferAccessor<T>> {
        descriptor.validate(ResourceKind::Buffer, AccessContext::Submission)?;
        cgh.register(
            self,
            Request {
                resource: self.id(),
                descriptor,
                region: region.clone(),
            },
        )?;

        Ok(BufferAccessor {
            storage: self.storage.clone(),
            descriptor,
            region,
        })
    }

    /// Synchronous host access to the whole buffer.
    ///
    /// Blocks until every earlier conflicting work item has finished. Work
    /// submitted afterwards that conflicts with `mode` waits until the
    /// returned accessor is dropped.
    pub fn host_access(&self, mode: AccessMode) -> DataflowResult<HostAccessor<T>> {
        let descriptor = AccessDescriptor::host(mode);
        descriptor.validate(ResourceKind::Buffer, AccessContext::Host)?;
        let region = Region::whole(&self.storage.extent);

        let lease = self.guard.scheduler().acquire_host(Request {
            resource: self.id(),
            descriptor,
            region: region.clone(),
        });

        Ok(HostAccessor {
            view: BufferAccessor {
                storage: self.storage.clone(),
                descriptor,
                region,
            },
            _lease: lease,
        })
    }

    /// Give up this handle. If it is the last one, wait for every work item
    /// touching the buffer and report the ones that failed.
    pub fn release(self) -> DataflowResult<()> {
        ReleaseGuard::release(self.guard)
    }
}

impl<T> Resource for Buffer<T> {
    fn id(&self) -> ResourceId {
        self.guard.id()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Buffer
    }

    fn scheduler(&self) -> &Scheduler {
        self.guard.scheduler()
    }
}

impl<T> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.guard.id())
            .field("extent", &self.storage.extent)
            .finish()
    }
}

/// Validated view of a buffer region, captured by kernel bodies.
///
/// Indices are relative to the accessor's offset.
pub struct BufferAccessor<T> {
    storage: Arc<BufferStorage<T>>,
    descriptor: AccessDescriptor,
    region: Region,
}

impl<T> Clone for BufferAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            descriptor: self.descriptor,
            region: self.region.clone(),
        }
    }
}

impl<T: Clone> BufferAccessor<T> {
    pub fn get(&self, index: &[usize]) -> DataflowResult<T> {
        let pos = self.region.linearize(&self.storage.extent, index)?;
        Ok(self.storage.data.read()[pos].clone())
    }

    pub fn set(&self, index: &[usize], value: T) -> DataflowResult<()> {
        if !self.is_writable() {
            return Err(DataflowError::ReadOnlyAccess {
                mode: self.descriptor.mode,
                target: self.descriptor.target,
            });
        }
        let pos = self.region.linearize(&self.storage.extent, index)?;
        self.storage.data.write()[pos] = value;
        Ok(())
    }

    /// Elements of the accessed region, row-major
    pub fn to_vec(&self) -> DataflowResult<Vec<T>> {
        let extent = &self.storage.extent;
        let data = self.storage.data.read();
        let mut out = Vec::with_capacity(self.region.len());
        walk(&self.region.range, |index| {
            out.push(data[self.region.linearize(extent, index)?].clone());
            Ok(())
        })?;
        Ok(out)
    }
}

impl<T> BufferAccessor<T> {
    /// Size of the accessed region
    pub fn extent(&self) -> &[usize] {
        &self.region.range
    }

    pub fn offset(&self) -> &[usize] {
        &self.region.offset
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn mode(&self) -> AccessMode {
        self.descriptor.mode
    }

    pub fn target(&self) -> AccessTarget {
        self.descriptor.target
    }

    fn is_writable(&self) -> bool {
        self.descriptor.mode.is_write_class()
            && self.descriptor.target != AccessTarget::ConstantMemory
    }
}

/// Host-side accessor; holds its grant until dropped
pub struct HostAccessor<T> {
    view: BufferAccessor<T>,
    _lease: HostLease,
}

impl<T: Clone> HostAccessor<T> {
    pub fn get(&self, index: &[usize]) -> DataflowResult<T> {
        self.view.get(index)
    }

    pub fn set(&self, index: &[usize], value: T) -> DataflowResult<()> {
        self.view.set(index, value)
    }

    pub fn to_vec(&self) -> DataflowResult<Vec<T>> {
        self.view.to_vec()
    }
}

impl<T> HostAccessor<T> {
    pub fn extent(&self) -> &[usize] {
        self.view.extent()
    }

    pub fn mode(&self) -> AccessMode {
        self.view.mode()
    }
}

/// Anonymous scratch memory scoped to one work item
pub struct LocalAccessor<T> {
    data: Arc<RwLock<Vec<T>>>,
    region: Region,
}

impl<T> Clone for LocalAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            region: self.region.clone(),
        }
    }
}

impl<T: Default + Clone> LocalAccessor<T> {
    pub(crate) fn allocate(extent: &[usize]) -> Self {
        let region = Region::whole(extent);
        Self {
            data: Arc::new(RwLock::new(vec![T::default(); region.len()])),
            region,
        }
    }

    pub fn get(&self, index: &[usize]) -> DataflowResult<T> {
        let pos = self.region.linearize(&self.region.range, index)?;
        Ok(self.data.read()[pos].clone())
    }

    pub fn set(&self, index: &[usize], value: T) -> DataflowResult<()> {
        let pos = self.region.linearize(&self.region.range, index)?;
        self.data.write()[pos] = value;
        Ok(())
    }

    pub fn extent(&self) -> &[usize] {
        &self.region.range
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accessor(
        data: Vec<i32>,
        extent: &[usize],
        region: Region,
        mode: AccessMode,
    ) -> BufferAccessor<i32> {
        BufferAccessor {
            storage: Arc::new(BufferStorage {
                extent: extent.to_vec(),
                data: RwLock::new(data),
            }),
            descriptor: AccessDescriptor::global(mode),
            region,
        }
    }

    #[test]
    fn test_from_vec_checks_extent() {
        let scheduler = Scheduler::default();
        let err = Buffer::from_vec(&scheduler, &[2, 2], vec![1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            DataflowError::ExtentMismatch {
                extent: vec![2, 2],
                expected: 4,
                actual: 3,
            }
        );
    }

    #[test]
    fn test_sub_range_indexing() {
        let extent = [3, 3];
        let region = Region::within(&extent, &[1, 1], &[2, 2]).unwrap();
        let acc = accessor((0..9).collect(), &extent, region, AccessMode::ReadWrite);

        assert_eq!(acc.get(&[0, 0]).unwrap(), 4);
        assert_eq!(acc.to_vec().unwrap(), vec![4, 5, 7, 8]);

        acc.set(&[1, 1], 80).unwrap();
        assert_eq!(acc.get(&[1, 1]).unwrap(), 80);
        assert!(matches!(
            acc.get(&[2, 0]),
            Err(DataflowError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_read_accessor_rejects_writes() {
        let acc = accessor(vec![1, 2], &[2], Region::whole(&[2]), AccessMode::Read);
        assert!(matches!(
            acc.set(&[0], 5),
            Err(DataflowError::ReadOnlyAccess { .. })
        ));
        assert_eq!(acc.get(&[0]).unwrap(), 1);
    }

    #[test]
    fn test_host_access_round_trip() {
        let scheduler = Scheduler::default();
        let buf = Buffer::from_vec(&scheduler, &[4], vec![1, 2, 3, 4]).unwrap();

        {
            let host = buf.host_access(AccessMode::ReadWrite).unwrap();
            host.set(&[2], 30).unwrap();
        }

        let host = buf.host_access(AccessMode::Read).unwrap();
        assert_eq!(host.to_vec().unwrap(), vec![1, 2, 30, 4]);
        assert!(host.set(&[0], 9).is_err());
        drop(host);

        buf.release().unwrap();
    }

    #[test]
    fn test_host_access_on_fresh_buffer() {
        let scheduler = Scheduler::default();
        let buf = Buffer::from_vec(&scheduler, &[2], vec![1, 2]).unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);

        let host = buf.clone();
        std::thread::spawn(move || {
            let contents = host.host_access(AccessMode::Read).and_then(|h| h.to_vec());
            let _ = tx.send(contents);
        });

        let contents = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(contents.unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_release_drains_only_on_last_handle() {
        let scheduler = Scheduler::default();
        let buf: Buffer<u8> = Buffer::new(&scheduler, &[2]);
        let other = buf.clone();

        buf.release().unwrap();
        assert_eq!(other.len(), 2);
        other.release().unwrap();
        assert_eq!(scheduler.statistics().tracked_resources, 0);
    }

    #[test]
    fn test_local_scratch() {
        let scratch: LocalAccessor<f32> = LocalAccessor::allocate(&[2, 2]);
        scratch.set(&[1, 0], 2.5).unwrap();
        assert_eq!(scratch.get(&[1, 0]).unwrap(), 2.5);
        assert_eq!(scratch.get(&[0, 0]).unwrap(), 0.0);
        assert!(scratch.get(&[2, 0]).is_err());
    }
}
