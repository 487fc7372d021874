//! Logging system configuration and initialization
//!
//! - `RUST_LOG` overrides the configured level and module filters
//! - Console output plus a non-blocking file writer per run
//!   (`inventory-prober-<timestamp>.log`)
//! - Optional JSON format
//! - Old log files beyond `max_files` are removed at start

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use tracing::{info, warn};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Re-export LoggingConfig from config module
pub use crate::infrastructure::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "inventory-prober";

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Log directory: the configured one, or `logs/` next to the executable
#[must_use]
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    if let Some(directory) = &config.directory {
        return directory.clone();
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Builds the filter directive string from level + module filters
fn filter_directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.module_filters.iter().collect();
    modules.sort();

    let mut directives = config.level.clone();
    for (module, level) in modules {
        directives.push_str(&format!(",{}={}", module, level));
    }
    directives
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(filter_directives(config))
            .map_err(|e| anyhow!("Invalid log filter {:?}: {}", config.level, e)),
    }
}

/// Initialize logging with custom configuration
///
/// ```bash
/// # Show detailed HTTP logs
/// RUST_LOG="debug,reqwest=debug,hyper=debug" inventory-prober
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(config)?;
    let registry = Registry::default().with(env_filter);

    let result = match (config.file_output, config.console_output) {
        (true, console) => {
            let log_dir = get_log_directory(config);
            std::fs::create_dir_all(&log_dir)
                .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
            cleanup_old_logs(&log_dir, config.max_files)?;

            let log_file_name = format!(
                "{}-{}.log",
                LOG_FILE_PREFIX,
                chrono::Local::now().format("%Y%m%dT%H%M%S")
            );
            let (file_writer, file_guard) = non_blocking(rolling::never(&log_dir, &log_file_name));

            // Store the guard globally to prevent it from being dropped
            LOG_GUARDS
                .lock()
                .map_err(|_| anyhow!("Log guard registry poisoned"))?
                .push(file_guard);

            if config.json_format {
                let file_layer = fmt::Layer::new()
                    .json()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false);
                let console_layer = console.then(|| fmt::Layer::new().with_writer(std::io::stdout).with_target(false));
                registry.with(file_layer).with(console_layer).try_init()
            } else {
                let file_layer = fmt::Layer::new()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_ansi(false);
                let console_layer = console.then(|| fmt::Layer::new().with_writer(std::io::stdout).with_target(false));
                registry.with(file_layer).with(console_layer).try_init()
            }
        }
        (false, true) => {
            if config.json_format {
                registry
                    .with(fmt::Layer::new().json().with_writer(std::io::stdout))
                    .try_init()
            } else {
                registry
                    .with(fmt::Layer::new().with_writer(std::io::stdout).with_target(false))
                    .try_init()
            }
        }
        (false, false) => return Err(anyhow!("No logging output configured")),
    };
    result.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!(
        level = %config.level,
        json = config.json_format,
        console = config.console_output,
        file = config.file_output,
        "Logging system initialized"
    );
    if config.file_output {
        info!("Log directory: {:?}", get_log_directory(config));
    }
    Ok(())
}

/// Keeps the newest `max_files - 1` logs so the new run's file fits the limit
fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log"));
        if !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let keep = (max_files as usize).saturating_sub(1);
    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove old log file {:?}: {}", path, e);
        }
    }
    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Inventory Prober System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("===========================================");
}
