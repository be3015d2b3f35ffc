mod log;

mod backend;
mod blob;
mod cache;
mod classify;
mod cli;
mod clock;
mod config;
mod duplicates;
mod error;
mod ingest;
mod invalidator;
mod models;
mod priority;
mod rules;
mod service;
mod sync;
mod threads;

#[cfg(test)]
mod testutil;

use cache::CacheStore;
use classify::HeuristicClassifier;
use clock::{Clock, SystemClock};
use config::{default_config_path, Config};
use invalidator::{ExpiryPolicy, Invalidator};
use priority::PriorityScorer;
use service::MailCache;
use std::path::PathBuf;
use std::sync::Arc;
use sync::LeaseSync;
use threads::ThreadGraphBuilder;
use tracing::{error, info, warn};

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    std::process::exit(1);
}

fn print_help_config() {
    let config_path = default_config_path();
    println!("Default config file: {}", config_path.display());
    println!();
    println!("Available options:");
    println!();
    println!("[cache]");
    println!("  path = \"/path/store.redb\"     # Local store (default: $XDG_CACHE_HOME/mailcache/store.redb)");
    println!("  message_ttl_hours = 24       # Messages expire this long after their last update");
    println!("  thread_ttl_hours = 12        # Thread records expire this long after recomputation");
    println!("  smart_folder_ttl_hours = 48  # Smart folders expire this long after last use");
    println!("  sweep_interval_secs = 900    # How often expired rows are removed");
    println!();
    println!("[remote]                         # Required: where the store and lease live");
    println!("  backend = \"http\"             # \"http\" (WebDAV-style object URL) or \"dir\" (shared filesystem)");
    println!("  url = \"https://.../mailcache/\" # Container URL (required for http)");
    println!("  username = \"me\"              # Optional Basic auth user");
    println!("  password_command = \"pass show mailcache\"  # Shell command returning the password");
    println!("  path = \"/mnt/share/mailcache\" # Directory (required for dir)");
    println!("  store_object = \"mailcache.json\"   # Snapshot object name");
    println!("  lease_object = \"mailcache.lease\"  # Lease marker object name");
    println!("  holder = \"laptop\"            # Lease holder name (default: hostname:pid)");
    println!();
    println!("[sync]");
    println!("  interval_secs = 3600         # Periodic sync interval");
    println!("  lease_window_secs = 300      # Lease lifetime");
    println!("  lease_refresh_fraction = 0.5 # Refresh before upload once this much of the window has passed");
    println!("  timeout_secs = 30            # Per-request network timeout");
    println!("  max_attempts = 4             # Attempts per sync before giving up");
    println!("  backoff_base_ms = 500        # First retry delay (doubles each attempt)");
    println!("  backoff_max_ms = 30000       # Retry delay cap");
    println!("  degraded_after = 3           # Consecutive failed syncs before status is degraded");
    println!("  shutdown_grace_secs = 10     # Time allowed for the final upload at exit");
    println!();
    println!("[analysis]                       # Changing any of these invalidates scores and categories");
    println!("  sender_threshold = 7         # Messages from a sender for full frequency weight");
    println!("  domain_threshold = 10        # Messages from a domain for full frequency weight");
    println!("  history_window_days = 90     # History considered for frequencies");
    println!("  recency_half_life_hours = 72 # Recency decay half-life");
    println!("  active_window_days = 30      # Threads with activity this recent are active");
    println!("  duplicate_window_hours = 24  # Near-identical messages closer than this are duplicates");
    println!("  thread_analysis = true       # Build thread records");
    println!("  priority_scoring = true      # Compute importance scores");
    println!("  owner_addresses = [\"me@example.com\"]  # Your addresses (awaiting-reply signal)");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("Usage: mailcache [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  --config=PATH    Use config file at PATH instead of default");
        eprintln!("  --cli            Run in JSON-over-stdin/stdout CLI mode");
        eprintln!("  --sync-once      Restore, run one sync cycle and exit");
        eprintln!("  --force-unlock   Remove the remote lease marker, whoever holds it");
        eprintln!("  --clear-cache    Delete the local store before starting");
        eprintln!("  --help-cli       Print CLI mode protocol documentation");
        eprintln!("  --help-config    Print default config path and all options");
        eprintln!("  --help           Show this help");
        std::process::exit(0);
    }

    if args.iter().any(|a| a == "--help-cli") {
        cli::print_help_cli();
        std::process::exit(0);
    }

    if args.iter().any(|a| a == "--help-config") {
        print_help_config();
        std::process::exit(0);
    }

    log::init();

    let config_path = args
        .iter()
        .find(|a| a.starts_with("--config="))
        .map(|a| PathBuf::from(&a["--config=".len()..]))
        .unwrap_or_else(default_config_path);

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config from {}: {}", config_path.display(), e);
            eprintln!("A minimal config file:");
            eprintln!();
            eprintln!("  [remote]");
            eprintln!("  backend = \"dir\"");
            eprintln!("  path = \"/mnt/share/mailcache\"");
            std::process::exit(1);
        }
    };

    if args.iter().any(|a| a == "--clear-cache") {
        match CacheStore::remove_file(&config.cache.path) {
            Ok(true) => eprintln!("Cache cleared."),
            Ok(false) => eprintln!("No cache at {}", config.cache.path.display()),
            Err(e) => fail(format!("Failed to clear cache: {}", e)),
        }
    }

    let blobs: Arc<dyn blob::BlobStore> = match blob::open(&config.remote, config.sync.timeout) {
        Ok(b) => Arc::from(b),
        Err(e) => fail(format!("Failed to open remote store: {}", e)),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = match CacheStore::open(
        &config.cache.path,
        ExpiryPolicy::from_config(&config.cache),
        clock.clone(),
    ) {
        Ok(s) => Arc::new(s),
        Err(e) => fail(format!(
            "Failed to open store at {}: {}",
            config.cache.path.display(),
            e
        )),
    };

    let threads = Arc::new(ThreadGraphBuilder::new(&config.analysis));
    let invalidator = Arc::new(Invalidator::new(store.clone(), threads.clone()));
    let lease_sync = Arc::new(LeaseSync::new(
        store.clone(),
        blobs,
        invalidator.clone(),
        clock,
        &config.remote,
        &config.sync,
    ));

    if args.iter().any(|a| a == "--force-unlock") {
        match lease_sync.force_unlock() {
            Ok(Some(lease)) => eprintln!(
                "Removed lease held by {} (expires {})",
                lease.holder, lease.expires_at
            ),
            Ok(None) => eprintln!("No readable lease marker; removed anything present."),
            Err(e) => fail(format!("Failed to remove lease: {}", e)),
        }
        std::process::exit(0);
    }

    match lease_sync.restore() {
        Ok(_) => {}
        Err(e) if e.is_contention() => {
            warn!("[Sync] restore skipped: {}; serving the local copy", e)
        }
        Err(e) => error!("[Sync] restore gave up: {}; serving the local copy", e),
    }

    match invalidator.check_analysis_fingerprint(&config.analysis) {
        Ok(true) => info!("[Invalidator] analysis parameters changed since last run"),
        Ok(false) => {}
        Err(e) => error!("[Invalidator] fingerprint check failed: {}", e),
    }

    if args.iter().any(|a| a == "--sync-once") {
        match lease_sync.sync_with_retry() {
            Ok(outcome) => {
                println!(
                    "{}",
                    serde_json::to_string(&outcome).unwrap_or_else(|e| e.to_string())
                );
                std::process::exit(0);
            }
            Err(e) => fail(format!("Sync failed: {}", e)),
        }
    }

    if !args.iter().any(|a| a == "--cli") {
        fail("Nothing to do: pass --cli or --sync-once (see --help)");
    }

    let classifier = match HeuristicClassifier::new() {
        Ok(c) => Arc::new(c),
        Err(e) => fail(format!("Failed to build classifier: {}", e)),
    };
    let scorer = Arc::new(PriorityScorer::new(&config.analysis));
    let service = MailCache::new(
        store,
        invalidator.clone(),
        threads,
        scorer,
        classifier,
        &config.analysis,
        Some(lease_sync.clone()),
    );

    let schedule = backend::Schedule {
        sync_interval: config.sync.interval,
        sweep_interval: config.cache.sweep_interval,
    };
    let worker = match backend::spawn(lease_sync.clone(), invalidator, schedule) {
        Ok(w) => Some(w),
        Err(e) => {
            error!("[Worker] failed to start: {}; periodic sync is off", e);
            None
        }
    };

    cli::run_cli(&service, worker.as_ref());

    if let Some(worker) = worker {
        worker.shutdown();
    }
    // Failures are logged inside; exit regardless.
    let _ = lease_sync.final_upload(config.sync.shutdown_grace);
}
