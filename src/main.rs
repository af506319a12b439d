use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use holdsync::config::SyncConfig;
use holdsync::engine::{Confirmation, HoldSync, ViewReconciler};
use holdsync::fetcher::HttpFetcher;
use holdsync::model::{HoldKey, StayQuery};
use holdsync::poller::{AvailabilityPoller, HostVisibility};
use holdsync::storage::FileStorage;

fn required_env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} must be set").into())
}

/// `482` or `inv:482` is an inventory id, `no:12` a room number.
fn parse_key(arg: &str) -> Option<HoldKey> {
    match arg.strip_prefix("no:") {
        Some(number) => HoldKey::from_number(number),
        None => HoldKey::from_inventory_id(arg.strip_prefix("inv:").unwrap_or(arg)),
    }
}

fn handle_command(
    line: &str,
    sync: &HoldSync,
    query: &StayQuery,
    visibility: &HostVisibility,
    poller: &AvailabilityPoller,
    view: &ViewReconciler,
) {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else { return };
    let keys: Vec<HoldKey> = words.filter_map(parse_key).collect();

    match cmd {
        "hold" => {
            sync.hold_in_cart(&keys);
        }
        "confirm" | "book" => {
            let via = if cmd == "book" { Confirmation::Book } else { Confirmation::Paid };
            let written = sync.confirm(query, &keys, via);
            info!("confirmed {} holds, {written} persisted", keys.len());
        }
        "cancel" => {
            sync.cancel(&keys);
        }
        "clear" => {
            let released = sync.clear_cart();
            info!("released {released} cart identifiers");
        }
        "hide" => visibility.set_visible(false),
        "show" => visibility.set_visible(true),
        "status" => {
            let status = poller.status();
            info!(
                "state={:?} loading={} held={} in_cart={} last_error={:?}",
                status.state,
                status.loading,
                sync.registry().held_count(),
                sync.registry().cart_count(),
                status.last_error
            );
            if let Some(latest) = status.latest {
                match serde_json::to_string(&view.render(&latest.snapshot)) {
                    Ok(json) => info!("{json}"),
                    Err(e) => warn!("could not render view: {e}"),
                }
            }
        }
        other => warn!("unknown command: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = SyncConfig::from_env();
    holdsync::observability::init(config.metrics_port)?;

    let query = StayQuery::new(
        required_env("HOLDSYNC_UNIT_ID")?,
        required_env("HOLDSYNC_START_DATE")?,
        required_env("HOLDSYNC_END_DATE")?,
    );

    let storage = Arc::new(FileStorage::from_config(&config)?);
    let sync = Arc::new(HoldSync::new(storage, &config));
    let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
    let visibility = HostVisibility::new(true);

    info!("holdsync session {} for {query}", sync.session_id());
    info!("  catalog: {}", config.catalog_url);
    info!("  profile: {} in {}", config.profile, config.data_dir.display());
    info!("  poll interval: {:?}", config.poll_interval);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let view = Arc::new(ViewReconciler::mount("inventory", sync.clone(), query.clone()));
    let mut poller = AvailabilityPoller::new(fetcher, visibility.clone(), config.poll_interval);

    let render_view = view.clone();
    poller.start(
        query.clone(),
        move |update| {
            let rendered = render_view.render(&update.snapshot);
            let held = rendered.sub_units.iter().filter(|s| s.locally_held).count();
            info!(
                total = rendered.totals.total_units,
                available = rendered.totals.available_units,
                occupied = rendered.totals.occupied_units,
                sub_units = rendered.sub_units.len(),
                held,
                initial = update.initial,
                "availability refreshed"
            );
        },
        |message| warn!("availability unavailable: {message}"),
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_command(&line, &sync, &query, &visibility, &poller, &view),
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin error: {e}");
                        stdin_open = false;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    poller.stop();
    info!("holdsync stopped");
    Ok(())
}
