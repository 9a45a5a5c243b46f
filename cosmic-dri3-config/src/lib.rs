// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

fn default_validate_bounds() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dri3Config {
    /// Reject imports whose `offset + stride * height` runs past the end of the
    /// backing file, whenever the file reports a size.
    #[serde(default = "default_validate_bounds")]
    pub validate_bounds: bool,
    /// Upper bound on live pixmaps of the software framebuffer screen.
    #[serde(default)]
    pub pixmap_limit: Option<usize>,
}

impl Default for Dri3Config {
    fn default() -> Dri3Config {
        Dri3Config {
            validate_bounds: default_validate_bounds(),
            pixmap_limit: None,
        }
    }
}
