// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    os::fd::{AsRawFd, BorrowedFd},
    ptr::NonNull,
    rc::Rc,
};

use rustix::{
    io::Errno,
    mm::{MapFlags, ProtFlags},
};
use tracing::{trace, warn};

/// Maps external file descriptors into the process.
pub trait RegionMapper {
    /// Maps `len` bytes of `fd` at `offset`, read-only and shared.
    fn map(&self, fd: BorrowedFd<'_>, len: usize, offset: u64) -> rustix::io::Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping returned by [`Self::map`] that
    /// has not been unmapped yet, and nothing may access it afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MmapMapper;

impl RegionMapper for MmapMapper {
    fn map(&self, fd: BorrowedFd<'_>, len: usize, offset: u64) -> rustix::io::Result<NonNull<u8>> {
        // SAFETY: we ask for a fresh address and only read through it while the
        // owning `MappedRegion` is alive.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(Errno::INVAL)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }
}

/// One live mapping of an external buffer. Unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    mapper: Rc<dyn RegionMapper>,
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl MappedRegion {
    pub fn map(
        mapper: &Rc<dyn RegionMapper>,
        fd: BorrowedFd<'_>,
        len: usize,
        offset: u64,
    ) -> rustix::io::Result<MappedRegion> {
        let ptr = mapper.map(fd, len, offset)?;
        trace!(fd = fd.as_raw_fd(), len, offset, ?ptr, "mapped region");
        Ok(MappedRegion {
            ptr,
            len,
            mapper: mapper.clone(),
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        trace!(ptr = ?self.ptr, len = self.len, "unmapping region");
        // SAFETY: the region came from a successful `map` and `drop` runs once.
        if let Err(err) = unsafe { self.mapper.unmap(self.ptr, self.len) } {
            warn!(?err, ptr = ?self.ptr, len = self.len, "Failed to unmap region");
        }
    }
}
