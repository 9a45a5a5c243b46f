// SPDX-License-Identifier: GPL-3.0-only

//! Import of client buffers shared as one mmappable fd, for display servers
//! rendering into software framebuffers.

pub mod config;
pub mod dri3;
pub mod screen;
pub mod utils;
