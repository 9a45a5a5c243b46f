// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::{Cell, RefCell},
    fs::File,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    ptr::NonNull,
};

use rustix::{fs::MemfdFlags, io::Errno};

use super::mapping::{MmapMapper, RegionMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEvent {
    Map {
        fd: RawFd,
        len: usize,
        offset: u64,
        addr: usize,
    },
    Unmap {
        addr: usize,
        len: usize,
    },
}

/// Real mmap, with every call written down.
#[derive(Debug, Default)]
pub struct RecordingMapper {
    pub events: RefCell<Vec<MapEvent>>,
    pub attempts: Cell<usize>,
    pub fail_maps: Cell<bool>,
}

impl RecordingMapper {
    pub fn maps(&self) -> Vec<MapEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, MapEvent::Map { .. }))
            .copied()
            .collect()
    }

    pub fn unmaps(&self) -> Vec<MapEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|event| matches!(event, MapEvent::Unmap { .. }))
            .copied()
            .collect()
    }
}

impl RegionMapper for RecordingMapper {
    fn map(&self, fd: BorrowedFd<'_>, len: usize, offset: u64) -> rustix::io::Result<NonNull<u8>> {
        self.attempts.set(self.attempts.get() + 1);
        if self.fail_maps.get() {
            return Err(Errno::NODEV);
        }
        let ptr = MmapMapper.map(fd, len, offset)?;
        self.events.borrow_mut().push(MapEvent::Map {
            fd: fd.as_raw_fd(),
            len,
            offset,
            addr: ptr.as_ptr() as usize,
        });
        Ok(ptr)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> rustix::io::Result<()> {
        self.events.borrow_mut().push(MapEvent::Unmap {
            addr: ptr.as_ptr() as usize,
            len,
        });
        // SAFETY: forwarded from the caller.
        unsafe { MmapMapper.unmap(ptr, len) }
    }
}

pub fn memfd(len: usize) -> File {
    let fd = rustix::fs::memfd_create("cosmic-dri3-test", MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, len as u64).unwrap();
    File::from(fd)
}
