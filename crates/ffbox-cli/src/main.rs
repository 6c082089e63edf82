//! ffbox: mount an object-store tree as a local filesystem.
//!
//! Commands:
//!   mount <source> <mountpoint>  - mount s3://bucket/prefix or a deployed dir
//!   push <local_dir> <s3_url>    - upload a tree and write its manifests
//!   deploy <local_dir>           - write manifests locally, no upload
//!   unmount <mountpoint>         - unmount a live ffbox mountpoint

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use ffbox_store::{ObjectStore, Source};

// ── CLI structure ─────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ffbox",
    version,
    about = "Lazy-fetching object-store filesystem",
    long_about = "ffbox: mount S3 buckets or deployed directories as local \
                  filesystems that fetch and cache objects on first access"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount a source at a local directory
    ///
    /// The source is either s3://bucket[/prefix] or an absolute path to a
    /// deployed directory. Reads fetch lazily into the cache; writes stay
    /// local and are never uploaded.
    Mount {
        /// s3://bucket[/prefix] or an absolute deployed directory
        source: String,
        /// Local mountpoint
        mountpoint: PathBuf,
        /// Wipe the cache directory before mounting
        #[arg(long)]
        clean: bool,
        /// Base cache directory (default: ~/.cache/ffbox)
        #[arg(long, env = "FFBOX_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
        /// Exact cache directory for this mount (overrides --cache-dir)
        #[arg(long)]
        cache_repo: Option<PathBuf>,
    },

    /// Upload a local tree to S3 and write per-directory manifests
    ///
    /// Requires AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY. If the tree's
    /// .ffbox/config.json names a run command, it is traced first to record
    /// the read order replayed by future mounts.
    Push {
        /// Local directory to push
        local_dir: PathBuf,
        /// Destination, s3://bucket[/prefix]
        s3_url: String,
    },

    /// Write .ffbox_dir_meta.json manifests into a local tree, no upload
    Deploy {
        /// Local directory to deploy
        local_dir: PathBuf,
    },

    /// Unmount an ffbox mountpoint
    Unmount {
        /// Mountpoint to unmount
        mountpoint: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Mount {
            source,
            mountpoint,
            clean,
            cache_dir,
            cache_repo,
        } => cmd_mount(&source, &mountpoint, clean, cache_dir, cache_repo).await,
        Commands::Push { local_dir, s3_url } => cmd_push(&local_dir, &s3_url).await,
        Commands::Deploy { local_dir } => cmd_deploy(&local_dir).await,
        Commands::Unmount { mountpoint } => cmd_unmount(&mountpoint),
    }
}

// ── `ffbox mount` ─────────────────────────────────────────────────────────

async fn cmd_mount(
    source: &str,
    mountpoint: &Path,
    clean: bool,
    cache_dir: Option<PathBuf>,
    cache_repo: Option<PathBuf>,
) -> Result<()> {
    let source = Source::parse(source).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mountpoint = absolutize(mountpoint)?;

    let cache_root = match cache_repo {
        Some(dir) => dir,
        None => {
            let base = cache_dir.unwrap_or_else(default_cache_base);
            base.join(source.cache_subdir(&mountpoint))
        }
    };

    println!("🔵 mounting {source} at {}", mountpoint.display());
    println!("🔵 cache: {}", cache_root.display());

    ffbox_fuse::mount(ffbox_fuse::MountOpts {
        source,
        mountpoint: mountpoint.clone(),
        cache_root,
        clean,
    })
    .await
    .context("mount failed")?;

    println!("🟢 unmounted {}", mountpoint.display());
    Ok(())
}

fn default_cache_base() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| {
        std::env::temp_dir().to_string_lossy().into_owned()
    });
    PathBuf::from(home).join(".cache").join("ffbox")
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("resolving current dir")?
            .join(path))
    }
}

// ── `ffbox push` ──────────────────────────────────────────────────────────

async fn cmd_push(local_dir: &Path, s3_url: &str) -> Result<()> {
    let source = Source::parse(s3_url).map_err(|e| anyhow::anyhow!("{e}"))?;
    if source.is_local() {
        println!("🔴 push needs an s3:// destination, got {s3_url}");
        anyhow::bail!("invalid push destination");
    }
    if std::env::var("AWS_ACCESS_KEY_ID").is_err() || std::env::var("AWS_SECRET_ACCESS_KEY").is_err()
    {
        println!("🔴 AWS_ACCESS_KEY_ID or AWS_SECRET_ACCESS_KEY is not set");
        anyhow::bail!("missing S3 credentials");
    }

    let store = ObjectStore::open(source)?;
    println!("🔵 pushing {} to {s3_url}", local_dir.display());

    let pb = make_progress_bar("push");
    let pb_clone = pb.clone();
    let progress: ffbox_sync::ProgressFn = Box::new(move |done, total, msg| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
        pb_clone.set_message(msg.to_string());
    });

    let stats = ffbox_sync::push_tree(&store, local_dir, Some(&progress))
        .await
        .with_context(|| format!("pushing {}", local_dir.display()))?;
    pb.finish_with_message("done");

    println!(
        "🟢 pushed {} files ({}) and {} manifests",
        stats.files,
        fmt_bytes(stats.bytes),
        stats.dirs
    );
    Ok(())
}

// ── `ffbox deploy` ────────────────────────────────────────────────────────

async fn cmd_deploy(local_dir: &Path) -> Result<()> {
    println!("🔵 deploying {}", local_dir.display());
    let stats = ffbox_sync::deploy_tree(local_dir)
        .await
        .with_context(|| format!("deploying {}", local_dir.display()))?;
    println!(
        "🟢 wrote {} manifests covering {} files",
        stats.dirs, stats.files
    );
    println!("🔵 mount it with: ffbox mount {} <mountpoint>", local_dir.display());
    Ok(())
}

// ── `ffbox unmount` ───────────────────────────────────────────────────────

fn cmd_unmount(mountpoint: &Path) -> Result<()> {
    // Linux: fusermount3 first, plain umount as fallback (root / FUSE-T)
    let status = std::process::Command::new("fusermount3")
        .args(["-u", &mountpoint.to_string_lossy()])
        .status();

    match status {
        Ok(s) if s.success() => {
            println!("🟢 unmounted {}", mountpoint.display());
            Ok(())
        }
        _ => {
            let fallback = std::process::Command::new("umount").arg(mountpoint).status();
            match fallback {
                Ok(s) if s.success() => {
                    println!("🟢 unmounted {}", mountpoint.display());
                    Ok(())
                }
                _ => {
                    println!(
                        "🔴 unmount failed, try: fusermount3 -u {}",
                        mountpoint.display()
                    );
                    anyhow::bail!("unmount failed")
                }
            }
        }
    }
}

// ── Utilities ─────────────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
