// SPDX-License-Identifier: GPL-3.0-only

//! DRI3 support for buffers shared as a single mmappable fd.
//!
//! Importing maps the fd read-only and points a fresh pixmap at the mapping.
//! The mapping is kept in a side table keyed by the pixmap, and the screen's
//! `DestroyPixmap` proc is wrapped so the mapping is dropped right after the
//! last reference to the pixmap has been destroyed.

use std::{
    cell::RefCell,
    collections::TryReserveError,
    rc::{Rc, Weak},
};

use cosmic_dri3_config::Dri3Config;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::screen::{Pixmap, PixmapRef, Screen, ScreenProcs};

pub mod import;
mod info;
pub mod mapping;
pub mod privates;
#[cfg(test)]
pub(crate) mod testing;
pub mod wrap;

pub use self::import::{ImportDescriptor, ImportError, RAW_MMAPPABLE_FD};
pub use self::info::{
    drm_format_for_depth, Dri3ScreenInfo, ExportedPixmap, DRI3_SCREEN_INFO_VERSION,
    DRM_FORMAT_ARGB8888, DRM_FORMAT_RGB565, DRM_FORMAT_XRGB2101010, DRM_FORMAT_XRGB8888,
};
use self::{
    mapping::{MappedRegion, MmapMapper, RegionMapper},
    privates::PixmapPrivates,
    wrap::{CloseScreenSlot, DestroyPixmapSlot, Wrapped},
};

const PIXMAP_PRIVATES_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("no screen to initialize DRI3 on")]
    NoScreen,
    #[error("DRI3 supports a single screen, found {0}")]
    MultipleScreens(usize),
    #[error("failed to allocate pixmap private storage")]
    PrivateAlloc(#[from] TryReserveError),
}

/// The mapping backing an imported pixmap.
#[derive(Debug)]
struct PixmapMapping {
    pixmap: Weak<Pixmap>,
    region: MappedRegion,
}

impl Drop for PixmapMapping {
    fn drop(&mut self) {
        // A pixmap outliving its mapping must not keep pointing into it.
        if let Some(pixmap) = self.pixmap.upgrade() {
            if pixmap.header().data == Some(self.region.as_ptr()) {
                pixmap.clear_data();
            }
        }
    }
}

#[derive(Debug)]
struct ScreenWraps {
    destroy_pixmap: Wrapped<DestroyPixmapSlot>,
    close_screen: Wrapped<CloseScreenSlot>,
}

pub(crate) struct ScreenPriv {
    /// Index of the screen whose procs are wrapped.
    screen: usize,
    config: Dri3Config,
    mapper: Rc<dyn RegionMapper>,
    privates: PixmapPrivates<PixmapMapping>,
    /// `None` once the screen is closed.
    wraps: Option<ScreenWraps>,
}

/// Handle to the DRI3 state of the one screen it was initialized on.
#[derive(Clone)]
pub struct Dri3Handle(Rc<RefCell<ScreenPriv>>);

impl std::fmt::Debug for Dri3Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.0.borrow();
        f.debug_struct("Dri3Handle")
            .field("screen", &state.screen)
            .field("config", &state.config)
            .field("mapped_pixmaps", &state.privates.len())
            .field("closed", &state.wraps.is_none())
            .finish()
    }
}

impl Dri3Handle {
    /// Imports a descriptor as a pixmap holding one reference.
    ///
    /// `screen` has to be the screen this handle was initialized on.
    pub fn import(
        &self,
        screen: &mut dyn Screen,
        descriptor: &ImportDescriptor<'_>,
    ) -> Result<PixmapRef, ImportError> {
        import::import(screen, &self.0, descriptor)
    }

    /// Number of imported pixmaps whose mapping is still alive.
    pub fn mapped_pixmaps(&self) -> usize {
        self.0.borrow().privates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().wraps.is_none()
    }

    /// Index of the screen DRI3 was initialized on.
    pub fn screen(&self) -> usize {
        self.0.borrow().screen
    }

    pub fn config(&self) -> Dri3Config {
        self.0.borrow().config.clone()
    }
}

/// Sets up DRI3 on the only screen of `screens`.
pub fn screen_init<S: Screen>(
    screens: &mut [S],
    config: Dri3Config,
) -> Result<Dri3Handle, InitError> {
    screen_init_with_mapper(screens, config, Rc::new(MmapMapper))
}

pub fn screen_init_with_mapper<S: Screen>(
    screens: &mut [S],
    config: Dri3Config,
    mapper: Rc<dyn RegionMapper>,
) -> Result<Dri3Handle, InitError> {
    let screen = match screens {
        [] => return Err(InitError::NoScreen),
        [screen] => screen,
        screens => return Err(InitError::MultipleScreens(screens.len())),
    };

    let privates = PixmapPrivates::try_with_capacity(PIXMAP_PRIVATES_CAPACITY)?;
    let state = Rc::new(RefCell::new(ScreenPriv {
        screen: screen.index(),
        config,
        mapper,
        privates,
        wraps: None,
    }));

    let procs = screen.procs_mut();
    let destroy_pixmap = {
        let state = state.clone();
        Wrapped::<DestroyPixmapSlot>::install(
            procs,
            Rc::new(move |pixmap: &PixmapRef| dri3_destroy_pixmap(&state, pixmap)),
        )
    };
    let close_screen = {
        let state = state.clone();
        Wrapped::<CloseScreenSlot>::install(
            procs,
            Rc::new(move |procs: &mut ScreenProcs| dri3_close_screen(&state, procs)),
        )
    };
    state.borrow_mut().wraps = Some(ScreenWraps {
        destroy_pixmap,
        close_screen,
    });

    info!(screen = screen.index(), "DRI3 initialized");
    Ok(Dri3Handle(state))
}

#[profiling::function]
fn dri3_destroy_pixmap(state: &RefCell<ScreenPriv>, pixmap: &PixmapRef) -> bool {
    // Decide before delegating: the previous proc drops the reference and
    // frees the pixmap once it was the last one.
    let (previous, mapping) = {
        let mut state = state.borrow_mut();
        let Some(previous) = state
            .wraps
            .as_ref()
            .map(|wraps| wraps.destroy_pixmap.previous().clone())
        else {
            warn!(id = ?pixmap.id(), "DestroyPixmap called on a closed screen");
            return false;
        };
        let mapping = if pixmap.refcnt() == 1 {
            state.privates.take(pixmap.id())
        } else {
            None
        };
        (previous, mapping)
    };

    let ret = previous(pixmap);

    if let Some(mapping) = mapping {
        trace!(id = ?pixmap.id(), len = mapping.region.len(), "releasing pixmap mapping");
        drop(mapping);
    }
    ret
}

fn dri3_close_screen(state: &RefCell<ScreenPriv>, procs: &mut ScreenProcs) -> bool {
    let privates = {
        let mut state = state.borrow_mut();
        if let Some(wraps) = state.wraps.take() {
            wraps.destroy_pixmap.restore(procs);
            wraps.close_screen.restore(procs);
        }
        std::mem::take(&mut state.privates)
    };

    for (id, mapping) in privates.into_entries() {
        warn!(?id, "pixmap still mapped at screen close");
        drop(mapping);
    }
    debug!("DRI3 screen state freed");

    let close = procs.close_screen.clone();
    close(procs)
}

#[cfg(test)]
mod test {
    use std::{
        cell::Cell,
        os::fd::{AsFd, BorrowedFd},
        os::unix::fs::FileExt,
        rc::Rc,
    };

    use cosmic_dri3_config::Dri3Config;

    use super::{
        screen_init, screen_init_with_mapper,
        testing::{memfd, MapEvent, RecordingMapper},
        wrap::{DestroyPixmapSlot, Wrapped},
        Dri3Handle, ImportDescriptor, InitError, RAW_MMAPPABLE_FD,
    };
    use crate::screen::{fb::FbScreen, PixmapRef, Screen};

    fn setup() -> (FbScreen, Dri3Handle, Rc<RecordingMapper>) {
        let mut screens = [FbScreen::new(0)];
        let mapper = Rc::new(RecordingMapper::default());
        let dri3 =
            screen_init_with_mapper(&mut screens, Dri3Config::default(), mapper.clone()).unwrap();
        let [screen] = screens;
        (screen, dri3, mapper)
    }

    fn descriptor<'a>(fds: &'a [BorrowedFd<'a>]) -> ImportDescriptor<'a> {
        ImportDescriptor {
            fds,
            width: 100,
            height: 50,
            strides: &[400],
            offsets: &[0],
            depth: 24,
            bits_per_pixel: 32,
            modifier: RAW_MMAPPABLE_FD,
        }
    }

    #[test]
    fn refuses_multiple_screens() {
        let mut screens = [FbScreen::new(0), FbScreen::new(1)];
        assert!(matches!(
            screen_init(&mut screens, Dri3Config::default()),
            Err(InitError::MultipleScreens(2))
        ));

        let mut none: [FbScreen; 0] = [];
        assert!(matches!(
            screen_init(&mut none, Dri3Config::default()),
            Err(InitError::NoScreen)
        ));
    }

    #[test]
    fn last_reference_unmaps_once() {
        let (mut screen, dri3, mapper) = setup();
        let file = memfd(20000);
        let fds = [file.as_fd()];
        let pixmap = dri3.import(&mut screen, &descriptor(&fds)).unwrap();
        let addr = pixmap.header().data.unwrap().as_ptr() as usize;

        assert!(screen.destroy_pixmap(&pixmap));
        assert_eq!(pixmap.refcnt(), 0);
        assert_eq!(
            mapper.unmaps(),
            vec![MapEvent::Unmap { addr, len: 20000 }]
        );
        assert_eq!(dri3.mapped_pixmaps(), 0);
        assert_eq!(screen.live_pixmaps(), 0);
    }

    #[test]
    fn shared_pixmap_stays_mapped() {
        let (mut screen, dri3, mapper) = setup();
        let file = memfd(20000);
        let fds = [file.as_fd()];
        let pixmap = dri3.import(&mut screen, &descriptor(&fds)).unwrap();

        pixmap.reference();
        assert_eq!(pixmap.refcnt(), 2);
        screen.destroy_pixmap(&pixmap);
        assert_eq!(pixmap.refcnt(), 1);
        assert!(mapper.unmaps().is_empty());
        assert_eq!(dri3.mapped_pixmaps(), 1);
        assert!(pixmap.with_pixels(|pixels| pixels.len()).is_some());

        screen.destroy_pixmap(&pixmap);
        assert_eq!(pixmap.refcnt(), 0);
        assert_eq!(mapper.unmaps().len(), 1);
    }

    #[test]
    fn pixels_follow_the_backing_file() {
        let (mut screen, dri3, _mapper) = setup();
        let file = memfd(20000);
        file.write_at(&[0xff; 4], 400).unwrap();
        let fds = [file.as_fd()];
        let pixmap = dri3.import(&mut screen, &descriptor(&fds)).unwrap();

        let row = |pixmap: &PixmapRef| pixmap.with_pixels(|pixels| pixels[400..404].to_vec());
        assert_eq!(row(&pixmap), Some(vec![0xff; 4]));

        file.write_at(&[0x11, 0x22, 0x33, 0x44], 400).unwrap();
        assert_eq!(row(&pixmap), Some(vec![0x11, 0x22, 0x33, 0x44]));

        screen.destroy_pixmap(&pixmap);
        assert_eq!(row(&pixmap), None);
    }

    #[test]
    fn native_pixmaps_pass_through() {
        let (mut screen, dri3, mapper) = setup();
        let pixmap = screen.create_pixmap(8, 8, 24).unwrap();
        assert!(screen.destroy_pixmap(&pixmap));
        assert_eq!(screen.live_pixmaps(), 0);
        assert!(mapper.events.borrow().is_empty());
        assert_eq!(dri3.mapped_pixmaps(), 0);
    }

    #[test]
    fn mapping_released_after_previous_proc() {
        let mut screens = [FbScreen::new(0)];
        let mapper = Rc::new(RecordingMapper::default());

        // A wrapper installed before DRI3 sits behind it in the chain and
        // must observe the pixmap before anything is unmapped.
        let seen_unmaps = Rc::new(Cell::new(usize::MAX));
        let inner = {
            let mapper = mapper.clone();
            let seen_unmaps = seen_unmaps.clone();
            let base = screens[0].procs().destroy_pixmap.clone();
            Rc::new(move |pixmap: &PixmapRef| {
                seen_unmaps.set(mapper.unmaps().len());
                base(pixmap)
            })
        };
        let inner = Wrapped::<DestroyPixmapSlot>::install(screens[0].procs_mut(), inner);

        let dri3 =
            screen_init_with_mapper(&mut screens, Dri3Config::default(), mapper.clone()).unwrap();
        let [mut screen] = screens;

        let file = memfd(20000);
        let fds = [file.as_fd()];
        let pixmap = dri3.import(&mut screen, &descriptor(&fds)).unwrap();
        screen.destroy_pixmap(&pixmap);

        assert_eq!(seen_unmaps.get(), 0);
        assert_eq!(mapper.unmaps().len(), 1);

        assert!(screen.close_screen());
        assert!(inner.restore(screen.procs_mut()));
    }

    #[test]
    fn close_restores_procs() {
        let mut screens = [FbScreen::new(0)];
        let destroy = screens[0].procs().destroy_pixmap.clone();
        let close = screens[0].procs().close_screen.clone();

        let dri3 = screen_init(&mut screens, Dri3Config::default()).unwrap();
        let [mut screen] = screens;
        assert!(!Rc::ptr_eq(&screen.procs().destroy_pixmap, &destroy));
        assert!(!Rc::ptr_eq(&screen.procs().close_screen, &close));

        assert!(screen.close_screen());
        assert!(screen.is_closed());
        assert!(dri3.is_closed());
        assert!(Rc::ptr_eq(&screen.procs().destroy_pixmap, &destroy));
        assert!(Rc::ptr_eq(&screen.procs().close_screen, &close));
    }

    #[test]
    fn close_releases_leftover_mappings() {
        let (mut screen, dri3, mapper) = setup();
        let file = memfd(20000);
        let fds = [file.as_fd()];
        let pixmap = dri3.import(&mut screen, &descriptor(&fds)).unwrap();

        assert!(screen.close_screen());
        assert_eq!(mapper.unmaps().len(), 1);
        assert!(pixmap.header().data.is_none());
        assert!(pixmap.with_pixels(|_| ()).is_none());

        // The restored base proc still frees the pixmap, nothing is unmapped twice.
        screen.destroy_pixmap(&pixmap);
        assert_eq!(screen.live_pixmaps(), 0);
        assert_eq!(mapper.unmaps().len(), 1);
    }

    #[test]
    fn import_after_close_fails() {
        let (mut screen, dri3, mapper) = setup();
        screen.close_screen();

        let file = memfd(20000);
        let fds = [file.as_fd()];
        assert!(dri3.import(&mut screen, &descriptor(&fds)).is_err());
        assert_eq!(mapper.attempts.get(), 0);
    }
}
