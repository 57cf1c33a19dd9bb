//! File Modification Tracker - host-level file-integrity monitoring agent
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;

use filemod_tracker::config::Settings;
use fimtrack_core::prelude::*;

/// Host-level file-integrity monitoring agent
#[derive(Parser, Debug)]
#[command(name = "fimtrackd")]
#[command(about = "Host-level file-integrity monitoring agent", long_about = None)]
struct Args {
    /// Path to the settings file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the HTTP bind address (e.g. 127.0.0.1:8080)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Monitor an additional directory (repeatable; replaces the
    /// configured set when given)
    #[arg(long = "monitor-dir", value_name = "DIR")]
    monitor_dirs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    fimtrack_core::logging::init()?;

    let mut settings = Settings::load(args.config.as_deref());
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    if !args.monitor_dirs.is_empty() {
        settings.monitor.directories = args.monitor_dirs;
    }

    info!(
        "Monitoring {:?} via engine {:?}",
        settings.monitor.directories, settings.monitor.engine_binary
    );

    filemod_tracker::run(settings).await
}
