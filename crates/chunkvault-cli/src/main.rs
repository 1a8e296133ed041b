// crates/chunkvault-cli/src/main.rs

#![forbid(unsafe_code)]
#![deny(
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo
)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkvault_sync::SyncConfig;
use chunkvault_transport::{CachePaths, VerifiedChannel};

#[derive(Parser, Debug)]
#[command(
    name = "chunkvault",
    about = "chunkvault reference CLI",
    long_about = "chunkvault reference CLI.\n\nExercises the core transport against a remote origin: open a channel, read a byte range, prebuffer ahead of a read, or verify the local tree's root hash.",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Open a channel against a remote URL and print its size.
    Open {
        /// URL of the content file; its Merkle companion is `{url}.mrkl`.
        url: String,

        /// Local cache file path (content, reference tree, and local tree
        /// are derived from this base path).
        #[arg(long, default_value = "chunkvault-cache.bin")]
        cache: PathBuf,
    },

    /// Read `length` bytes starting at `offset` and write them to stdout.
    Cat {
        url: String,

        #[arg(long, default_value = "chunkvault-cache.bin")]
        cache: PathBuf,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long)]
        length: u64,
    },

    /// Schedule a byte range to be painted in the background and wait for it.
    Prebuffer {
        url: String,

        #[arg(long, default_value = "chunkvault-cache.bin")]
        cache: PathBuf,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        #[arg(long)]
        length: u64,
    },

    /// Print whether every chunk of the local tree is currently valid.
    VerifyTree {
        url: String,

        #[arg(long, default_value = "chunkvault-cache.bin")]
        cache: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Open { url, cache } => open(&url, cache).await,
        Cmd::Cat {
            url,
            cache,
            offset,
            length,
        } => cat(&url, cache, offset, length).await,
        Cmd::Prebuffer {
            url,
            cache,
            offset,
            length,
        } => prebuffer(&url, cache, offset, length).await,
        Cmd::VerifyTree { url, cache } => verify_tree(&url, cache).await,
    }
}

async fn open_channel(url: &str, cache: PathBuf) -> Result<VerifiedChannel> {
    let client = reqwest::Client::new();
    let cache_paths = CachePaths::from_base(cache);
    VerifiedChannel::open(client, url, &cache_paths, &SyncConfig::default())
        .await
        .with_context(|| format!("opening channel against {url}"))
}

async fn open(url: &str, cache: PathBuf) -> Result<()> {
    let channel = open_channel(url, cache).await?;
    info!(size = channel.size(), "channel opened");
    println!("{}", channel.size());
    channel.close();
    Ok(())
}

async fn cat(url: &str, cache: PathBuf, offset: u64, length: u64) -> Result<()> {
    let channel = open_channel(url, cache).await?;
    let mut buf = vec![0u8; length as usize];
    let n = channel
        .read(&mut buf, offset)
        .await
        .with_context(|| format!("reading {length} bytes at offset {offset}"))?;
    std::io::stdout()
        .write_all(&buf[..n])
        .context("writing bytes to stdout")?;
    channel.close();
    Ok(())
}

async fn prebuffer(url: &str, cache: PathBuf, offset: u64, length: u64) -> Result<()> {
    let channel = open_channel(url, cache).await?;
    channel
        .prebuffer(offset, length)
        .wait()
        .await
        .context("prebuffering range")?;
    info!(offset, length, "prebuffer complete");
    channel.close();
    Ok(())
}

async fn verify_tree(url: &str, cache: PathBuf) -> Result<()> {
    let channel = open_channel(url, cache).await?;
    let total_chunks = chunkvault_geometry::Geometry::new(channel.size()).total_chunks();
    let all_verified = (0..total_chunks).all(|i| channel.is_verified(i));
    println!("{all_verified}");
    channel.close();
    Ok(())
}

/// Initialize tracing with an env-driven filter (default INFO).
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true).compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}
