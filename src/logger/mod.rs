// SPDX-License-Identifier: GPL-3.0-only

use anyhow::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_logger() -> Result<()> {
    let level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,cosmic_dri3={}", level)));

    let fmt_layer = fmt::layer().compact().with_writer(std::io::stderr);
    let journald = tracing_journald::layer();
    let journald_err = journald.as_ref().err().map(ToString::to_string);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(journald.ok())
        .try_init()?;
    log_panics::init();

    if let Some(err) = journald_err {
        warn!(%err, "Failed to connect to journald, logging to stderr only");
    }

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    debug!(
        "Debug build ({})",
        std::option_env!("GIT_HASH").unwrap_or("Unknown")
    );

    Ok(())
}
