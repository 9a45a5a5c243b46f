// SPDX-License-Identifier: GPL-3.0-only

//! The boundary to the hosting display server.
//!
//! A [`Screen`] owns an operation table ([`ScreenProcs`]) whose slots other
//! subsystems may wrap, and hands out reference-counted [`Pixmap`]s. The
//! host drops a pixmap reference by calling [`Screen::destroy_pixmap`], which
//! dispatches through whatever handler currently occupies the slot.

use std::{
    cell::{Cell, RefCell},
    fmt,
    ptr::NonNull,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

pub mod fb;

static NEXT_PIXMAP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique pixmap identity. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixmapId(u64);

impl PixmapId {
    fn next() -> PixmapId {
        PixmapId(NEXT_PIXMAP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixmapHeader {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub bits_per_pixel: u8,
    /// Bytes per row.
    pub stride: u32,
    pub data: Option<NonNull<u8>>,
}

impl PixmapHeader {
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

pub struct Pixmap {
    id: PixmapId,
    refcnt: Cell<u32>,
    header: Cell<PixmapHeader>,
    /// Bytes readable at `header.data`.
    backing_len: Cell<usize>,
    storage: RefCell<Option<Box<[u8]>>>,
}

pub type PixmapRef = Rc<Pixmap>;

impl fmt::Debug for Pixmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pixmap")
            .field("id", &self.id)
            .field("refcnt", &self.refcnt.get())
            .field("header", &self.header.get())
            .field("backing_len", &self.backing_len.get())
            .finish()
    }
}

impl Pixmap {
    /// Creates a pixmap holding a single reference.
    ///
    /// The header's data pointer is taken from `storage`, whatever `header`
    /// carries.
    pub fn new(mut header: PixmapHeader, mut storage: Option<Box<[u8]>>) -> PixmapRef {
        header.data = storage
            .as_mut()
            .and_then(|storage| NonNull::new(storage.as_mut_ptr()));
        let backing_len = storage.as_ref().map_or(0, |storage| storage.len());
        Rc::new(Pixmap {
            id: PixmapId::next(),
            refcnt: Cell::new(1),
            header: Cell::new(header),
            backing_len: Cell::new(backing_len),
            storage: RefCell::new(storage),
        })
    }

    pub fn id(&self) -> PixmapId {
        self.id
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.get()
    }

    pub fn reference(&self) {
        self.refcnt.set(self.refcnt.get() + 1);
    }

    /// Drops one reference and returns how many remain.
    ///
    /// Only destroy handlers call this; everybody else releases a pixmap
    /// through [`Screen::destroy_pixmap`].
    pub fn unreference(&self) -> u32 {
        let remaining = self.refcnt.get().saturating_sub(1);
        self.refcnt.set(remaining);
        remaining
    }

    pub fn header(&self) -> PixmapHeader {
        self.header.get()
    }

    /// Number of bytes readable at the header's data pointer.
    pub fn backing_len(&self) -> usize {
        self.backing_len.get()
    }

    /// Replaces the header along with the length of the memory it points at.
    ///
    /// # Safety
    ///
    /// If `header.data` is set, it must be valid for reads of `backing_len`
    /// bytes for as long as it stays in this pixmap's header, that is until
    /// the header is replaced, [`Pixmap::clear_data`] is called, or the last
    /// reference is destroyed.
    pub unsafe fn set_header(&self, header: PixmapHeader, backing_len: usize) {
        let backing_len = if header.data.is_some() { backing_len } else { 0 };
        self.header.set(header);
        self.backing_len.set(backing_len);
    }

    /// Detaches the pixmap from its pixel memory. The geometry is kept.
    pub fn clear_data(&self) {
        let mut header = self.header.get();
        header.data = None;
        self.header.set(header);
        self.backing_len.set(0);
    }

    /// Releases host-owned pixel storage, if any.
    pub fn take_storage(&self) -> Option<Box<[u8]>> {
        self.storage.borrow_mut().take()
    }

    pub fn has_storage(&self) -> bool {
        self.storage.borrow().is_some()
    }

    /// Runs `f` over the pixel bytes the header currently points at.
    ///
    /// Returns `None` for pixmaps without pixel data, including destroyed
    /// ones, and for pixmaps whose geometry runs past the memory behind them.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if self.refcnt.get() == 0 {
            return None;
        }
        let header = self.header.get();
        let data = header.data?;
        if header.byte_len() > self.backing_len.get() {
            return None;
        }
        // SAFETY: `data` is readable for `backing_len` bytes, which is a
        // contract of every way to set it, and `byte_len` fits within that.
        let pixels = unsafe { std::slice::from_raw_parts(data.as_ptr(), header.byte_len()) };
        Some(f(pixels))
    }
}

pub type DestroyPixmapProc = dyn Fn(&PixmapRef) -> bool;
pub type CloseScreenProc = dyn Fn(&mut ScreenProcs) -> bool;

/// Per-screen operation table.
///
/// Slots are replaced only through [`crate::dri3::wrap::Wrapped`], which
/// remembers the previous handler so it can be delegated to and restored.
#[derive(Clone)]
pub struct ScreenProcs {
    pub(crate) destroy_pixmap: Rc<DestroyPixmapProc>,
    pub(crate) close_screen: Rc<CloseScreenProc>,
}

impl fmt::Debug for ScreenProcs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScreenProcs").finish_non_exhaustive()
    }
}

impl ScreenProcs {
    pub fn new(destroy_pixmap: Rc<DestroyPixmapProc>, close_screen: Rc<CloseScreenProc>) -> Self {
        ScreenProcs {
            destroy_pixmap,
            close_screen,
        }
    }
}

pub trait Screen {
    fn index(&self) -> usize;

    fn procs(&self) -> &ScreenProcs;
    fn procs_mut(&mut self) -> &mut ScreenProcs;

    /// Allocates a pixmap with one reference, or `None` if the host is out of
    /// resources.
    fn create_pixmap(&mut self, width: u16, height: u16, depth: u8) -> Option<PixmapRef>;

    /// Points `pixmap` at new geometry and pixel data. A header without data
    /// keeps the current pixels and only changes the geometry. Geometry that
    /// does not fit the memory behind it is refused.
    ///
    /// # Safety
    ///
    /// Same as [`Pixmap::set_header`]: a `header.data` that is set must stay
    /// valid for reads of `backing_len` bytes while the pixmap points at it.
    unsafe fn modify_pixmap_header(
        &mut self,
        pixmap: &Pixmap,
        header: PixmapHeader,
        backing_len: usize,
    ) -> bool;

    /// Drops one reference to `pixmap` through the current destroy handler.
    fn destroy_pixmap(&self, pixmap: &PixmapRef) -> bool {
        let destroy = self.procs().destroy_pixmap.clone();
        destroy(pixmap)
    }

    /// Tears the screen down through the current close handler.
    fn close_screen(&mut self) -> bool {
        let close = self.procs().close_screen.clone();
        close(self.procs_mut())
    }
}
