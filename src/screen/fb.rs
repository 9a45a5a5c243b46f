// SPDX-License-Identifier: GPL-3.0-only

//! A software framebuffer screen: pixmaps live in plain heap memory.

use std::{cell::Cell, rc::Rc};

use tracing::{debug, trace};

use super::{Pixmap, PixmapHeader, PixmapRef, Screen, ScreenProcs};

#[derive(Debug)]
pub struct FbScreen {
    index: usize,
    procs: ScreenProcs,
    live: Rc<Cell<usize>>,
    closed: Rc<Cell<bool>>,
    pixmap_limit: Option<usize>,
}

fn bits_per_pixel(depth: u8) -> u8 {
    match depth {
        1 => 1,
        2..=8 => 8,
        9..=16 => 16,
        _ => 32,
    }
}

/// Rows are padded to 32 bit units.
fn padded_stride(width: u16, bpp: u8) -> u32 {
    (u32::from(width) * u32::from(bpp)).div_ceil(32) * 4
}

fn fb_destroy_pixmap(live: &Cell<usize>, pixmap: &PixmapRef) -> bool {
    if pixmap.unreference() > 0 {
        return true;
    }

    pixmap.clear_data();
    pixmap.take_storage();
    live.set(live.get().saturating_sub(1));
    trace!(id = ?pixmap.id(), "freed pixmap");
    true
}

impl FbScreen {
    pub fn new(index: usize) -> FbScreen {
        let live = Rc::new(Cell::new(0));
        let closed = Rc::new(Cell::new(false));

        let destroy_live = live.clone();
        let close_flag = closed.clone();
        let procs = ScreenProcs::new(
            Rc::new(move |pixmap: &PixmapRef| fb_destroy_pixmap(&destroy_live, pixmap)),
            Rc::new(move |_: &mut ScreenProcs| {
                close_flag.set(true);
                true
            }),
        );

        FbScreen {
            index,
            procs,
            live,
            closed,
            pixmap_limit: None,
        }
    }

    pub fn with_pixmap_limit(mut self, limit: Option<usize>) -> FbScreen {
        self.pixmap_limit = limit;
        self
    }

    pub fn live_pixmaps(&self) -> usize {
        self.live.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

impl Screen for FbScreen {
    fn index(&self) -> usize {
        self.index
    }

    fn procs(&self) -> &ScreenProcs {
        &self.procs
    }

    fn procs_mut(&mut self) -> &mut ScreenProcs {
        &mut self.procs
    }

    fn create_pixmap(&mut self, width: u16, height: u16, depth: u8) -> Option<PixmapRef> {
        if self
            .pixmap_limit
            .is_some_and(|limit| self.live.get() >= limit)
        {
            debug!(limit = ?self.pixmap_limit, "pixmap limit reached");
            return None;
        }

        let bpp = bits_per_pixel(depth);
        let stride = padded_stride(width, bpp);
        let len = stride as usize * height as usize;
        let storage = (len > 0).then(|| vec![0u8; len].into_boxed_slice());

        let pixmap = Pixmap::new(
            PixmapHeader {
                width,
                height,
                depth,
                bits_per_pixel: bpp,
                stride,
                data: None,
            },
            storage,
        );
        self.live.set(self.live.get() + 1);
        Some(pixmap)
    }

    unsafe fn modify_pixmap_header(
        &mut self,
        pixmap: &Pixmap,
        mut header: PixmapHeader,
        mut backing_len: usize,
    ) -> bool {
        if pixmap.refcnt() == 0 {
            return false;
        }

        let current = pixmap.header();
        if header.data.is_none() {
            header.data = current.data;
            backing_len = pixmap.backing_len();
        }
        if header.data.is_some() && header.byte_len() > backing_len {
            debug!(
                id = ?pixmap.id(),
                len = header.byte_len(),
                backing_len,
                "pixmap header exceeds its backing"
            );
            return false;
        }

        // Pointing the header elsewhere orphans the pixmap's own pixels.
        if header.data != current.data {
            pixmap.take_storage();
        }
        // SAFETY: either the caller's pointer and length, or the ones the
        // pixmap already had.
        unsafe { pixmap.set_header(header, backing_len) };
        true
    }
}

#[cfg(test)]
mod test {
    use super::{padded_stride, FbScreen};
    use crate::screen::{PixmapHeader, Screen};

    #[test]
    fn stride_padding() {
        assert_eq!(padded_stride(100, 32), 400);
        assert_eq!(padded_stride(3, 8), 4);
        assert_eq!(padded_stride(33, 1), 8);
        assert_eq!(padded_stride(0, 32), 0);
    }

    #[test]
    fn pixmap_freed_on_last_reference() {
        let mut screen = FbScreen::new(0);
        let pixmap = screen.create_pixmap(16, 8, 24).unwrap();
        assert_eq!(pixmap.header().bits_per_pixel, 32);
        assert!(pixmap.has_storage());
        assert_eq!(pixmap.with_pixels(|pixels| pixels.len()), Some(16 * 4 * 8));

        pixmap.reference();
        assert!(screen.destroy_pixmap(&pixmap));
        assert_eq!(pixmap.refcnt(), 1);
        assert_eq!(screen.live_pixmaps(), 1);

        assert!(screen.destroy_pixmap(&pixmap));
        assert_eq!(pixmap.refcnt(), 0);
        assert_eq!(screen.live_pixmaps(), 0);
        assert!(!pixmap.has_storage());
        assert!(pixmap.with_pixels(|_| ()).is_none());
    }

    #[test]
    fn empty_pixmap_has_no_storage() {
        let mut screen = FbScreen::new(0);
        let pixmap = screen.create_pixmap(0, 0, 24).unwrap();
        assert!(!pixmap.has_storage());
        assert!(pixmap.header().data.is_none());
    }

    #[test]
    fn resize_must_fit_storage() {
        let mut screen = FbScreen::new(0);
        let pixmap = screen.create_pixmap(4, 4, 8).unwrap();
        let header = pixmap.header();

        let taller = PixmapHeader {
            height: 8,
            data: None,
            ..header
        };
        // SAFETY: no new data pointer is handed over.
        assert!(!unsafe { screen.modify_pixmap_header(&pixmap, taller, 0) });
        assert_eq!(pixmap.header(), header);

        let shorter = PixmapHeader {
            height: 2,
            data: None,
            ..header
        };
        // SAFETY: as above.
        assert!(unsafe { screen.modify_pixmap_header(&pixmap, shorter, 0) });
        assert!(pixmap.has_storage());
        assert_eq!(pixmap.with_pixels(|pixels| pixels.len()), Some(8));
    }

    #[test]
    fn pixmap_limit() {
        let mut screen = FbScreen::new(0).with_pixmap_limit(Some(1));
        let first = screen.create_pixmap(1, 1, 8).unwrap();
        assert!(screen.create_pixmap(1, 1, 8).is_none());
        screen.destroy_pixmap(&first);
        assert!(screen.create_pixmap(1, 1, 8).is_some());
    }

    #[test]
    fn close_runs_base_handler() {
        let mut screen = FbScreen::new(0);
        assert!(!screen.is_closed());
        assert!(screen.close_screen());
        assert!(screen.is_closed());
    }
}
