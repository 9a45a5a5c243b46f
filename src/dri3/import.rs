// SPDX-License-Identifier: GPL-3.0-only

use std::{cell::RefCell, os::fd::BorrowedFd, rc::Rc};

use rustix::io::Errno;
use thiserror::Error;
use tracing::{debug, trace};

use super::{mapping::MappedRegion, PixmapMapping, ScreenPriv};
use crate::screen::{PixmapHeader, PixmapRef, Screen};

/// The only modifier accepted: one linear buffer that can be mmapped as is.
pub const RAW_MMAPPABLE_FD: u64 = 1274;

#[derive(Debug, Clone, Copy)]
pub struct ImportDescriptor<'a> {
    pub fds: &'a [BorrowedFd<'a>],
    pub width: u16,
    pub height: u16,
    pub strides: &'a [u32],
    pub offsets: &'a [u32],
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub modifier: u64,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported buffer: {fds} fds with modifier {modifier:#x}")]
    Unsupported { fds: usize, modifier: u64 },
    #[error("invalid geometry: stride {stride} x height {height}")]
    InvalidGeometry { stride: u32, height: u16 },
    #[error("{len} bytes at offset {offset} exceed the backing size of {size} bytes")]
    OutOfBounds { len: usize, offset: u64, size: u64 },
    #[error("mmap failed")]
    MapFailed(#[source] Errno),
    #[error("failed to create pixmap")]
    AllocFailed,
    #[error("screen is closed")]
    ScreenClosed,
    #[error("DRI3 is set up on screen {expected}, not screen {found}")]
    WrongScreen { expected: usize, found: usize },
}

/// The single plane of an accepted descriptor.
#[derive(Debug, Clone, Copy)]
struct Plane<'a> {
    fd: BorrowedFd<'a>,
    stride: u32,
    offset: u64,
    len: usize,
}

impl<'a> ImportDescriptor<'a> {
    fn plane(&self) -> Result<Plane<'a>, ImportError> {
        let unsupported = || ImportError::Unsupported {
            fds: self.fds.len(),
            modifier: self.modifier,
        };
        if self.fds.len() != 1 || self.modifier != RAW_MMAPPABLE_FD {
            return Err(unsupported());
        }
        let (Some(&stride), Some(&offset)) = (self.strides.first(), self.offsets.first()) else {
            return Err(unsupported());
        };

        let invalid = ImportError::InvalidGeometry {
            stride,
            height: self.height,
        };
        let len = (stride as usize)
            .checked_mul(self.height as usize)
            .filter(|len| *len > 0)
            .ok_or(invalid)?;

        Ok(Plane {
            fd: self.fds[0],
            stride,
            offset: u64::from(offset),
            len,
        })
    }
}

/// Rejects mappings that run past the end of the backing file.
///
/// Files reporting a size of zero (dma-bufs among them) cannot be checked
/// and are trusted.
fn check_bounds(plane: &Plane<'_>) -> Result<(), ImportError> {
    let size = match rustix::fs::fstat(plane.fd) {
        Ok(stat) => u64::try_from(stat.st_size).unwrap_or(0),
        Err(err) => {
            debug!(?err, "Failed to stat buffer fd, trusting descriptor");
            return Ok(());
        }
    };
    if size == 0 {
        debug!("Buffer fd reports no size, trusting descriptor");
        return Ok(());
    }

    let end = plane.offset.checked_add(plane.len as u64);
    if end.is_none_or(|end| end > size) {
        return Err(ImportError::OutOfBounds {
            len: plane.len,
            offset: plane.offset,
            size,
        });
    }
    Ok(())
}

#[profiling::function]
pub(super) fn import(
    screen: &mut dyn Screen,
    state: &RefCell<ScreenPriv>,
    descriptor: &ImportDescriptor<'_>,
) -> Result<PixmapRef, ImportError> {
    let (mapper, validate_bounds) = {
        let state = state.borrow();
        if state.wraps.is_none() {
            return Err(ImportError::ScreenClosed);
        }
        // Only the registered screen's destroy proc releases mappings.
        if screen.index() != state.screen {
            return Err(ImportError::WrongScreen {
                expected: state.screen,
                found: screen.index(),
            });
        }
        (state.mapper.clone(), state.config.validate_bounds)
    };

    let plane = descriptor.plane()?;
    if validate_bounds {
        check_bounds(&plane)?;
    }

    let region = MappedRegion::map(&mapper, plane.fd, plane.len, plane.offset)
        .map_err(ImportError::MapFailed)?;

    // The region is dropped, and thereby unmapped, if this fails.
    let pixmap = screen
        .create_pixmap(0, 0, descriptor.depth)
        .ok_or(ImportError::AllocFailed)?;

    let current = pixmap.header();
    let header = PixmapHeader {
        width: descriptor.width,
        height: descriptor.height,
        depth: descriptor.depth,
        bits_per_pixel: match descriptor.bits_per_pixel {
            0 => current.bits_per_pixel,
            bpp => bpp,
        },
        stride: plane.stride,
        data: Some(region.as_ptr()),
    };
    let backing_len = region.len();

    state.borrow_mut().privates.set(
        pixmap.id(),
        PixmapMapping {
            pixmap: Rc::downgrade(&pixmap),
            region,
        },
    );

    // SAFETY: the region lives in the store until the last reference to the
    // pixmap is destroyed, and clears the pixmap's data if dropped earlier.
    if !unsafe { screen.modify_pixmap_header(&pixmap, header, backing_len) } {
        let mapping = state.borrow_mut().privates.take(pixmap.id());
        screen.destroy_pixmap(&pixmap);
        drop(mapping);
        return Err(ImportError::AllocFailed);
    }

    trace!(
        id = ?pixmap.id(),
        width = header.width,
        height = header.height,
        stride = header.stride,
        "imported pixmap"
    );
    Ok(pixmap)
}
