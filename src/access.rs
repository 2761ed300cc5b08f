//! Access descriptors
//!
//! A descriptor states how a work item intends to touch one resource. It is
//! plain data: validation happens when it is requested against a resource,
//! and the scheduler uses it (plus the accessed [`Region`]) to decide which
//! work items must not overlap in time.

use crate::error::{DataflowError, DataflowResult};
use crate::types::ResourceKind;
use serde::{Deserialize, Serialize};

/// Requested access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    /// Write without depending on previous contents
    DiscardWrite,
    DiscardReadWrite,
}

impl AccessMode {
    /// Anything but a pure read
    pub fn is_write_class(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Where the access lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessTarget {
    GlobalMemory,
    ConstantMemory,
    HostMemory,
    LocalScratch,
    PipeNonBlocking,
    PipeBlocking,
}

impl AccessTarget {
    pub fn is_pipe(self) -> bool {
        matches!(self, AccessTarget::PipeNonBlocking | AccessTarget::PipeBlocking)
    }
}

/// Whether a descriptor is requested from inside a command group or from
/// the host directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessContext {
    Submission,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessDescriptor {
    pub mode: AccessMode,
    pub target: AccessTarget,
}

impl AccessDescriptor {
    pub fn new(mode: AccessMode, target: AccessTarget) -> Self {
        Self { mode, target }
    }

    /// Kernel access to global memory
    pub fn global(mode: AccessMode) -> Self {
        Self::new(mode, AccessTarget::GlobalMemory)
    }

    /// Read-only kernel access through constant memory
    pub fn constant() -> Self {
        Self::new(AccessMode::Read, AccessTarget::ConstantMemory)
    }

    /// Immediate host access, outside any submission
    pub fn host(mode: AccessMode) -> Self {
        Self::new(mode, AccessTarget::HostMemory)
    }

    pub fn pipe_write(blocking: bool) -> Self {
        Self::new(AccessMode::Write, pipe_target(blocking))
    }

    pub fn pipe_read(blocking: bool) -> Self {
        Self::new(AccessMode::Read, pipe_target(blocking))
    }

    /// Check this descriptor against the resource kind and the context it
    /// is requested from. Never touches scheduling state.
    pub fn validate(&self, kind: ResourceKind, context: AccessContext) -> DataflowResult<()> {
        let reject = |reason: &'static str| {
            Err(DataflowError::InvalidAccessTarget {
                mode: self.mode,
                target: self.target,
                kind,
                reason,
            })
        };

        match kind {
            ResourceKind::Pipe => {
                if !self.target.is_pipe() {
                    return reject("pipes only accept pipe targets");
                }
                if !matches!(self.mode, AccessMode::Read | AccessMode::Write) {
                    return reject("pipe access is either read or write");
                }
                if context != AccessContext::Submission {
                    return reject("pipe access needs a command group");
                }
            }
            ResourceKind::Buffer => match (self.target, context) {
                (AccessTarget::PipeNonBlocking | AccessTarget::PipeBlocking, _) => {
                    return reject("pipe targets need a pipe");
                }
                (AccessTarget::LocalScratch, _) => {
                    return reject("local scratch is never backed by a resource");
                }
                (AccessTarget::HostMemory, AccessContext::Submission) => {
                    return reject("host access is only legal outside a command group");
                }
                (
                    AccessTarget::GlobalMemory | AccessTarget::ConstantMemory,
                    AccessContext::Host,
                ) => {
                    return reject("without a command group the target must be host memory");
                }
                (AccessTarget::ConstantMemory, AccessContext::Submission)
                    if self.mode.is_write_class() =>
                {
                    return reject("constant memory is read-only");
                }
                _ => {}
            },
            ResourceKind::Scratch => {
                if self.target != AccessTarget::LocalScratch {
                    return reject("scratch allocations use the local scratch target");
                }
                if context != AccessContext::Submission {
                    return reject("scratch memory is scoped to one work item");
                }
            }
        }

        Ok(())
    }

    /// Two grants on the same resource conflict unless both are reads.
    /// Pipe endpoints never conflict: the channel engine orders them.
    pub fn conflicts_with(&self, other: &AccessDescriptor) -> bool {
        if self.target.is_pipe() && other.target.is_pipe() {
            return false;
        }
        self.mode.is_write_class() || other.mode.is_write_class()
    }
}

fn pipe_target(blocking: bool) -> AccessTarget {
    if blocking {
        AccessTarget::PipeBlocking
    } else {
        AccessTarget::PipeNonBlocking
    }
}

/// Box `[offset, offset + range)` in each dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub offset: Vec<usize>,
    pub range: Vec<usize>,
}

impl Region {
    /// The whole of `extent`
    pub fn whole(extent: &[usize]) -> Self {
        Self {
            offset: vec![0; extent.len()],
            range: extent.to_vec(),
        }
    }

    /// Build a sub-range, checking it stays inside `extent`
    pub fn within(extent: &[usize], offset: &[usize], range: &[usize]) -> DataflowResult<Self> {
        let dims = extent.len().max(offset.len()).max(range.len());
        for dim in 0..dims {
            let bound = extent.get(dim).copied().unwrap_or(0);
            let off = offset.get(dim).copied().unwrap_or(0);
            let len = range.get(dim).copied().unwrap_or(0);
            let fits = dim < extent.len()
                && dim < offset.len()
                && dim < range.len()
                && off.checked_add(len).is_some_and(|end| end <= bound);
            if !fits {
                return Err(DataflowError::RangeOutOfBounds {
                    dim,
                    offset: off,
                    range: len,
                    extent: bound,
                });
            }
        }

        Ok(Self {
            offset: offset.to_vec(),
            range: range.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.range.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the two boxes share at least one element
    pub fn overlaps(&self, other: &Region) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.offset
            .iter()
            .zip(&self.range)
            .zip(other.offset.iter().zip(&other.range))
            .all(|((&a, &alen), (&b, &blen))| a < b + blen && b < a + alen)
    }

    /// Row-major linear position of `index` (relative to this region)
    /// inside a buffer of `extent`
    pub(crate) fn linearize(&self, extent: &[usize], index: &[usize]) -> DataflowResult<usize> {
        if index.len() != self.range.len() || index.iter().zip(&self.range).any(|(i, r)| i >= r) {
            return Err(DataflowError::IndexOutOfBounds {
                index: index.to_vec(),
                range: self.range.clone(),
            });
        }

        let mut linear = 0;
        for dim in 0..extent.len() {
            linear = linear * extent[dim] + self.offset[dim] + index[dim];
        }
        Ok(linear)
    }
}

/// Visit every index of `range` in row-major order
pub(crate) fn walk<E>(
    range: &[usize],
    mut f: impl FnMut(&[usize]) -> Result<(), E>,
) -> Result<(), E> {
    if range.iter().any(|&r| r == 0) {
        return Ok(());
    }

    let mut index = vec![0; range.len()];
    loop {
        f(&index)?;

        // Odometer increment, last dimension fastest
        let mut dim = range.len();
        loop {
            if dim == 0 {
                return Ok(());
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < range[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_read_pairs_share() {
        let read = AccessDescriptor::global(AccessMode::Read);
        let constant = AccessDescriptor::constant();
        assert!(!read.conflicts_with(&read));
        assert!(!read.conflicts_with(&constant));

        for mode in [
            AccessMode::Write,
            AccessMode::ReadWrite,
            AccessMode::DiscardWrite,
            AccessMode::DiscardReadWrite,
        ] {
            let writer = AccessDescriptor::global(mode);
            assert!(writer.conflicts_with(&read));
            assert!(read.conflicts_with(&writer));
            assert!(writer.conflicts_with(&writer));
        }
    }

    #[test]
    fn test_pipe_endpoints_do_not_conflict() {
        let w = AccessDescriptor::pipe_write(true);
        let r = AccessDescriptor::pipe_read(false);
        assert!(!w.conflicts_with(&r));
        assert!(!w.conflicts_with(&w));
    }

    #[test]
    fn test_buffer_targets() {
        let kind = ResourceKind::Buffer;
        let sub = AccessContext::Submission;
        let host = AccessContext::Host;

        assert!(AccessDescriptor::global(AccessMode::Write).validate(kind, sub).is_ok());
        assert!(AccessDescriptor::constant().validate(kind, sub).is_ok());
        assert!(AccessDescriptor::host(AccessMode::Read).validate(kind, host).is_ok());

        let cases = [
            (AccessDescriptor::global(AccessMode::Read), host),
            (AccessDescriptor::host(AccessMode::Read), sub),
            (AccessDescriptor::new(AccessMode::Write, AccessTarget::ConstantMemory), sub),
            (AccessDescriptor::new(AccessMode::ReadWrite, AccessTarget::LocalScratch), sub),
            (AccessDescriptor::pipe_read(true), sub),
        ];
        for (desc, ctx) in cases {
            let err = desc.validate(kind, ctx).unwrap_err();
            assert!(matches!(err, DataflowError::InvalidAccessTarget { .. }), "{desc:?}");
        }
    }

    #[test]
    fn test_pipe_targets() {
        let kind = ResourceKind::Pipe;
        let sub = AccessContext::Submission;

        assert!(AccessDescriptor::pipe_write(false).validate(kind, sub).is_ok());
        assert!(AccessDescriptor::pipe_read(true).validate(kind, sub).is_ok());
        assert!(AccessDescriptor::global(AccessMode::Read).validate(kind, sub).is_err());
        assert!(AccessDescriptor::new(AccessMode::ReadWrite, AccessTarget::PipeBlocking)
            .validate(kind, sub)
            .is_err());
        assert!(AccessDescriptor::pipe_read(true)
            .validate(kind, AccessContext::Host)
            .is_err());
    }

    #[test]
    fn test_scratch_target() {
        let desc = AccessDescriptor::new(AccessMode::ReadWrite, AccessTarget::LocalScratch);
        assert!(desc.validate(ResourceKind::Scratch, AccessContext::Submission).is_ok());
        assert!(desc.validate(ResourceKind::Scratch, AccessContext::Host).is_err());
    }

    #[test]
    fn test_region_bounds() {
        let extent = [4, 6];
        assert!(Region::within(&extent, &[1, 2], &[3, 4]).is_ok());

        let err = Region::within(&extent, &[1, 3], &[3, 4]).unwrap_err();
        assert_eq!(
            err,
            DataflowError::RangeOutOfBounds {
                dim: 1,
                offset: 3,
                range: 4,
                extent: 6,
            }
        );

        assert!(Region::within(&extent, &[0], &[1]).is_err());
        assert!(Region::within(&extent, &[usize::MAX, 0], &[1, 1]).is_err());
    }

    #[test]
    fn test_region_overlap() {
        let a = Region::within(&[8], &[0], &[4]).unwrap();
        let b = Region::within(&[8], &[4], &[4]).unwrap();
        let c = Region::within(&[8], &[3], &[2]).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));

        let rows = Region::within(&[4, 8], &[0, 0], &[2, 8]).unwrap();
        let cols = Region::within(&[4, 8], &[2, 0], &[2, 8]).unwrap();
        assert!(!rows.overlaps(&cols));
    }

    #[test]
    fn test_walk_is_row_major() {
        let mut seen = Vec::new();
        walk::<()>(&[2, 3], |i| {
            seen.push(i.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0], vec![0, 0]);
        assert_eq!(seen[1], vec![0, 1]);
        assert_eq!(seen[3], vec![1, 0]);
        assert_eq!(seen[5], vec![1, 2]);

        let mut count = 0;
        walk::<()>(&[4, 0], |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_linearize() {
        let extent = [3, 4];
        let sub = Region::within(&extent, &[1, 1], &[2, 2]).unwrap();
        assert_eq!(sub.linearize(&extent, &[0, 0]).unwrap(), 5);
        assert_eq!(sub.linearize(&extent, &[1, 1]).unwrap(), 10);
        assert!(sub.linearize(&extent, &[2, 0]).is_err());
        assert!(sub.linearize(&extent, &[0]).is_err());
    }
}
