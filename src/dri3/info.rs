// SPDX-License-Identifier: GPL-3.0-only

use std::os::fd::{BorrowedFd, OwnedFd};

use tracing::error;

use super::{import::ImportDescriptor, Dri3Handle};
use crate::screen::{Pixmap, PixmapRef, Screen};

pub const DRI3_SCREEN_INFO_VERSION: u32 = 2;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub const DRM_FORMAT_RGB565: u32 = fourcc(b"RG16");
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");
pub const DRM_FORMAT_XRGB2101010: u32 = fourcc(b"XR30");
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");

/// The DRM format of a pixmap with `bits_per_pixel`, or 0 if there is none.
///
/// The depth does not narrow the choice.
pub fn drm_format_for_depth(_depth: u8, bits_per_pixel: u8) -> u32 {
    match bits_per_pixel {
        16 => DRM_FORMAT_RGB565,
        24 => DRM_FORMAT_XRGB8888,
        30 => DRM_FORMAT_XRGB2101010,
        32 => DRM_FORMAT_ARGB8888,
        _ => 0,
    }
}

/// A pixmap exported as dma-buf style planes.
#[derive(Debug)]
pub struct ExportedPixmap {
    pub fds: Vec<OwnedFd>,
    pub strides: Vec<u32>,
    pub offsets: Vec<u32>,
    pub modifier: u64,
}

/// The hooks a DRI3 request dispatcher calls into for one screen.
pub trait Dri3ScreenInfo {
    fn version(&self) -> u32 {
        DRI3_SCREEN_INFO_VERSION
    }

    /// Creates a pixmap from client supplied buffers. Failures are logged and
    /// reported as `None`.
    #[allow(clippy::too_many_arguments)]
    fn pixmap_from_fds(
        &self,
        screen: &mut dyn Screen,
        fds: &[BorrowedFd<'_>],
        width: u16,
        height: u16,
        strides: &[u32],
        offsets: &[u32],
        depth: u8,
        bits_per_pixel: u8,
        modifier: u64,
    ) -> Option<PixmapRef>;

    fn fds_from_pixmap(&self, screen: &dyn Screen, pixmap: &Pixmap) -> Option<ExportedPixmap>;

    fn get_formats(&self, screen: &dyn Screen) -> Vec<u32>;

    fn get_modifiers(&self, screen: &dyn Screen, format: u32) -> Vec<u64>;

    fn get_drawable_modifiers(&self, screen: &dyn Screen, format: u32) -> Option<Vec<u64>>;
}

// Nothing is advertised through format negotiation: the one supported
// layout is accepted by `pixmap_from_fds` directly, and advertising more
// would invite tiled imports that cannot be mapped.
impl Dri3ScreenInfo for Dri3Handle {
    fn pixmap_from_fds(
        &self,
        screen: &mut dyn Screen,
        fds: &[BorrowedFd<'_>],
        width: u16,
        height: u16,
        strides: &[u32],
        offsets: &[u32],
        depth: u8,
        bits_per_pixel: u8,
        modifier: u64,
    ) -> Option<PixmapRef> {
        let descriptor = ImportDescriptor {
            fds,
            width,
            height,
            strides,
            offsets,
            depth,
            bits_per_pixel,
            modifier,
        };
        self.import(screen, &descriptor)
            .map_err(|err| {
                error!(?err, "DRI3: {}", err);
            })
            .ok()
    }

    fn fds_from_pixmap(&self, _screen: &dyn Screen, _pixmap: &Pixmap) -> Option<ExportedPixmap> {
        None
    }

    fn get_formats(&self, _screen: &dyn Screen) -> Vec<u32> {
        Vec::new()
    }

    fn get_modifiers(&self, _screen: &dyn Screen, _format: u32) -> Vec<u64> {
        Vec::new()
    }

    fn get_drawable_modifiers(&self, _screen: &dyn Screen, _format: u32) -> Option<Vec<u64>> {
        None
    }
}
