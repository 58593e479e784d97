//! treesync command-line interface.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;
use treesync::client::{Client, SyncListener, SyncStats};
use treesync::location::Location;
use treesync::model::{PathFilter, SyncOptions, DEFAULT_BUFFER_SIZE};
use treesync::server::{ConfigFile, Server, ServerConfig};
use treesync::Error;

#[derive(Parser)]
#[command(name = "treesync", version, about = "Converge one file tree onto another")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors and the final summary.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize DEST onto SOURCE (local path or sync://host:port/path).
    Sync {
        source: Location,
        dest: Location,

        /// Delete receiver entries with no sender counterpart.
        #[arg(long)]
        delete: bool,

        /// Report what would change without touching anything.
        #[arg(long)]
        dry_run: bool,

        /// Follow symlinks instead of skipping them.
        #[arg(long)]
        follow_symlinks: bool,

        /// Compare content digests, not just size and mtime.
        #[arg(short, long)]
        checksum: bool,

        /// Glob patterns to exclude (repeatable).
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,

        /// Transfer buffer size in bytes.
        #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,
    },

    /// Serve trees under ROOT to remote clients.
    Serve {
        root: PathBuf,

        /// Listen address (default 127.0.0.1:7878).
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// TOML configuration file; explicit flags override it.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long)]
        dispatchers: Option<usize>,

        #[arg(long)]
        workers: Option<usize>,

        /// Seconds before an idle connection is closed; 0 disables.
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Sync {
            source,
            dest,
            delete,
            dry_run,
            follow_symlinks,
            checksum,
            exclude,
            buffer_size,
        } => {
            let opts = SyncOptions::new(delete, dry_run, follow_symlinks, checksum, buffer_size)
                .context("buffer size must be positive")?;
            let filter = PathFilter::new(exclude);
            let mut listener = ConsoleListener::new(cli.quiet, dry_run);
            let stats = Client::new(opts, &mut listener)
                .sync(&source, &dest, &filter)
                .with_context(|| format!("sync {source} -> {dest} failed"))?;
            listener.finish();
            print_summary(&stats, dry_run);
            if stats.failed > 0 {
                bail!("{} item(s) failed", stats.failed);
            }
        }

        Commands::Serve {
            root,
            bind,
            config,
            dispatchers,
            workers,
            idle_timeout,
        } => {
            let mut server_config = ServerConfig::new(root);
            if let Some(path) = config {
                let file = ConfigFile::load(&path)?;
                server_config.apply_file(&file);
            }
            if let Some(bind) = bind {
                server_config = server_config.with_bind(bind);
            }
            if let Some(n) = dispatchers {
                server_config = server_config.with_dispatchers(n);
            }
            if let Some(n) = workers {
                server_config = server_config.with_workers(n);
            }
            if let Some(secs) = idle_timeout {
                server_config = server_config.with_idle_timeout(Duration::from_secs(secs));
            }

            let server = Server::start(server_config)?;
            eprintln!("serving on {}", server.local_addr());
            wait_for_interrupt();
            server.stop();
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "treesync=info",
        1 => "treesync=debug",
        _ => "treesync=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(unix)]
fn wait_for_interrupt() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
    while !INTERRUPTED.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    eprintln!("shutting down");
}

#[cfg(not(unix))]
fn wait_for_interrupt() {
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

/// Prints one line per action and keeps a spinner alive during transfers.
struct ConsoleListener {
    quiet: bool,
    prefix: &'static str,
    bar: ProgressBar,
}

impl ConsoleListener {
    fn new(quiet: bool, dry_run: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} {msg}").expect("static template"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        };
        Self {
            quiet,
            prefix: if dry_run { "(dry-run) " } else { "" },
            bar,
        }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            self.bar.println(text);
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl SyncListener for ConsoleListener {
    fn on_create(&mut self, item: &treesync::SyncItem) {
        self.line(format!("{}{} {}", self.prefix, "create".green(), item.path));
    }

    fn on_update(&mut self, item: &treesync::SyncItem) {
        self.line(format!("{}{} {}", self.prefix, "update".yellow(), item.path));
    }

    fn on_delete(&mut self, path: &str) {
        self.line(format!("{}{} {}", self.prefix, "delete".red(), path));
    }

    fn on_validate(&mut self, path: &str, passed: bool) {
        if !passed {
            self.line(format!("{} {}", "invalid".red().bold(), path));
        }
    }

    fn on_progress(&mut self, path: &str, bytes: u64, total: u64) {
        self.bar.set_message(format!("{path} {bytes}/{total}"));
    }

    fn on_error(&mut self, path: &str, err: &Error) {
        error!(path, error = %err, "item failed");
        self.line(format!("{} {path}: {err}", "failed".red().bold()));
    }
}

fn print_summary(stats: &SyncStats, dry_run: bool) {
    let prefix = if dry_run { "(dry-run) " } else { "" };
    println!(
        "{prefix}{} created, {} updated, {} deleted, {} validated, {} in sync, {} failed, {} bytes",
        stats.created,
        stats.updated,
        stats.deleted,
        stats.validated,
        stats.in_sync,
        stats.failed,
        stats.bytes_copied,
    );
}
