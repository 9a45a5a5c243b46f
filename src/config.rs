// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

pub use cosmic_dri3_config::Dri3Config;
use tracing::{debug, error, info};

use crate::utils::env;

/// Turns off bounds validation of imported descriptors when set.
pub const TRUST_DESCRIPTOR_VAR: &str = "COSMIC_DRI3_TRUST_DESCRIPTOR";

/// Loads the configuration from the first config file found, falling back
/// to defaults, and applies environment overrides.
pub fn load() -> Dri3Config {
    let xdg = xdg::BaseDirectories::new().ok();
    let mut config = load_static(&locations(xdg.as_ref()));

    if env::bool_var(TRUST_DESCRIPTOR_VAR).unwrap_or(false) {
        info!("{} set, not validating buffer bounds", TRUST_DESCRIPTOR_VAR);
        config.validate_bounds = false;
    }
    config
}

fn locations(xdg: Option<&xdg::BaseDirectories>) -> Vec<PathBuf> {
    let mut locations = if let Some(base) = xdg {
        vec![
            base.get_config_file("cosmic-dri3.ron"),
            base.get_config_file("cosmic-dri3/config.ron"),
        ]
    } else {
        Vec::with_capacity(2)
    };
    if cfg!(debug_assertions) {
        if let Ok(mut cwd) = std::env::current_dir() {
            cwd.push("config.ron");
            locations.push(cwd);
        }
    }
    locations.push(PathBuf::from("/etc/cosmic-dri3/config.ron"));
    locations
}

fn load_static(locations: &[PathBuf]) -> Dri3Config {
    for path in locations {
        debug!("Trying config location: {}", path.display());
        if path.exists() {
            info!("Using config at {}", path.display());
            return match read(path) {
                Ok(config) => config,
                Err(err) => {
                    error!(?err, "Malformed config file {}", path.display());
                    Dri3Config::default()
                }
            };
        }
    }

    Dri3Config::default()
}

fn read(path: &Path) -> anyhow::Result<Dri3Config> {
    let contents = std::fs::read_to_string(path)?;
    Ok(ron::from_str(&contents)?)
}
