// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::OsStr, fs::File, os::fd::AsFd, path::PathBuf, process, str::FromStr};

use anyhow::{anyhow, bail, Context, Result};
use clap_lex::RawArgs;
use tracing::{error, info};

use cosmic_dri3::{
    config::{self, Dri3Config},
    dri3::{self, Dri3ScreenInfo, RAW_MMAPPABLE_FD},
    screen::{fb::FbScreen, Screen},
};

mod logger;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeArgs {
    path: PathBuf,
    width: u16,
    height: u16,
    stride: Option<u32>,
    offset: u32,
    depth: u8,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    Version,
    Probe(ProbeArgs),
}

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {:?}", err);
        eprintln!("cosmic-dri3: {:#}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");

    let args = match parse_args(RawArgs::from_args())? {
        Command::Help => {
            print_help(env!("CARGO_PKG_VERSION"), git_hash);
            return Ok(());
        }
        Command::Version => {
            println!(
                "cosmic-dri3 {} (git commit {})",
                env!("CARGO_PKG_VERSION"),
                git_hash
            );
            return Ok(());
        }
        Command::Probe(args) => args,
    };

    logger::init_logger()?;
    profiling::register_thread!("Main Thread");
    #[cfg(feature = "profile-with-tracy")]
    tracy_client::Client::start();

    probe(&args, config::load())
}

fn parse_value<T: FromStr>(name: &str, value: Option<&OsStr>) -> Result<T> {
    let value = value.ok_or_else(|| anyhow!("--{} requires a value", name))?;
    value
        .to_str()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| anyhow!("Invalid value for --{}: {:?}", name, value))
}

fn parse_args(raw_args: RawArgs) -> Result<Command> {
    let mut cursor = raw_args.cursor();
    // binary name
    let _ = raw_args.next_os(&mut cursor);

    let mut path = None;
    let mut width = None;
    let mut height = None;
    let mut stride = None;
    let mut offset = 0;
    let mut depth = 24;

    while let Some(arg) = raw_args.next(&mut cursor) {
        if let Some((name, attached)) = arg.to_long() {
            let name = name.map_err(|name| anyhow!("Invalid argument {:?}", name))?;
            match name {
                "help" => return Ok(Command::Help),
                "version" => return Ok(Command::Version),
                _ => {}
            }
            let value = attached.or_else(|| raw_args.next_os(&mut cursor));
            match name {
                "width" => width = Some(parse_value(name, value)?),
                "height" => height = Some(parse_value(name, value)?),
                "stride" => stride = Some(parse_value(name, value)?),
                "offset" => offset = parse_value(name, value)?,
                "depth" => depth = parse_value(name, value)?,
                _ => bail!("Unknown option --{}", name),
            }
        } else if let Some(mut shorts) = arg.to_short() {
            match shorts.next_flag() {
                Some(Ok('h')) => return Ok(Command::Help),
                Some(Ok('V')) => return Ok(Command::Version),
                _ => bail!("Unknown option {:?}", arg.to_value_os()),
            }
        } else if path.is_none() {
            path = Some(PathBuf::from(arg.to_value_os()));
        } else {
            bail!("Unexpected argument {:?}", arg.to_value_os());
        }
    }

    Ok(Command::Probe(ProbeArgs {
        path: path.context("Missing buffer file")?,
        width: width.context("Missing --width")?,
        height: height.context("Missing --height")?,
        stride,
        offset,
        depth,
    }))
}

/// FNV-1a over the visible part of every row.
fn checksum(pixels: &[u8], stride: usize, row_len: usize) -> u64 {
    pixels
        .chunks(stride.max(1))
        .flat_map(|row| &row[..row_len.min(row.len())])
        .fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
}

fn probe(args: &ProbeArgs, config: Dri3Config) -> Result<()> {
    let file = File::open(&args.path)
        .with_context(|| format!("Failed to open {}", args.path.display()))?;

    let mut screens = [FbScreen::new(0).with_pixmap_limit(config.pixmap_limit)];
    let dri3 = dri3::screen_init(&mut screens, config).context("Failed to initialize DRI3")?;
    let screen = &mut screens[0];

    let stride = args.stride.unwrap_or(u32::from(args.width) * 4);
    let pixmap = dri3
        .pixmap_from_fds(
            screen,
            &[file.as_fd()],
            args.width,
            args.height,
            &[stride],
            &[args.offset],
            args.depth,
            32,
            RAW_MMAPPABLE_FD,
        )
        .with_context(|| format!("Failed to import {}", args.path.display()))?;

    let header = pixmap.header();
    let row_len = header.width as usize * usize::from(header.bits_per_pixel).div_ceil(8);
    let sum = pixmap
        .with_pixels(|pixels| checksum(pixels, header.stride as usize, row_len))
        .context("Imported pixmap has no pixels")?;
    info!(
        width = header.width,
        height = header.height,
        stride = header.stride,
        depth = header.depth,
        "Imported {}",
        args.path.display()
    );
    println!(
        "{}x{} stride {} depth {} checksum {:#018x}",
        header.width, header.height, header.stride, header.depth, sum
    );

    screen.destroy_pixmap(&pixmap);
    if dri3.mapped_pixmaps() != 0 {
        bail!("Mapping outlived the last pixmap reference");
    }
    screen.close_screen();

    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"cosmic-dri3 {version} (git commit {git_rev})
System76 <info@system76.com>

Imports a buffer file the way a DRI3 client shares a single mmappable fd,
and reports what the screen sees.

Usage: cosmic-dri3 --width <W> --height <H> [--stride <S>] [--offset <O>] [--depth <D>] <FILE>

Options:
  -h, --help     Show this message
  -V, --version  Show the version of cosmic-dri3"#
    );
}
