//! Standalone CLI that follows the live occupancy feed
//!
//! Run with: cargo run --features cli --bin occupancy-cli

#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use occupancy_live::cache::MemoryCountStore;
    use occupancy_live::graphql::GraphqlClient;
    use occupancy_live::time::now_millis;
    use occupancy_live::websocket_native::TokioTransport;
    use occupancy_live::{config, ConnectionManager, DashboardEvent};
    use std::time::Duration;
    use tracing::{debug, info, warn};
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,occupancy_live=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let settings = config::load()?;
    let timeframe = settings.timeframe;
    let locations = settings.locations.clone();
    info!(url = %settings.connection.url, ?locations, %timeframe, "Starting occupancy feed");

    let graphql = GraphqlClient::new(settings.graphql.endpoint.clone());
    let cache = match &settings.cache.path {
        Some(path) => Some(MemoryCountStore::load(path, settings.cache.entries_per_key)?),
        None => None,
    };

    let (transport, mut socket_events) = TokioTransport::new();
    let mut manager = ConnectionManager::new(settings, transport);
    if let Some(cache) = cache {
        manager = manager.with_cache(cache);
    }

    manager.events().subscribe(|event| match event {
        DashboardEvent::Counts { updates } => {
            for u in updates {
                info!(location = %u.location_id, count = u.count, timeframe = %u.timeframe, "count");
            }
        }
        DashboardEvent::Status { channel, status } => info!(%channel, ?status, "status"),
        other => debug!(event = other.name(), "event"),
    });

    let now = now_millis();
    for location in &locations {
        manager.watch_location(location, timeframe, now);
    }

    // Seed from the query API; the feed stays authoritative if this fails
    match graphql.all_locations().await {
        Ok(summaries) => {
            for s in summaries.iter().filter(|s| locations.contains(&s.id)) {
                if let Some(count) = s.live_count {
                    manager.seed_count(&s.id, timeframe, count.max(0) as u64, now_millis());
                }
            }
        }
        Err(e) => warn!(error = %e, "Could not seed counts"),
    }
    for location in &locations {
        match graphql.sampling_data(location, timeframe).await {
            Ok(points) => manager.seed_chart(location, timeframe, points),
            Err(e) => warn!(location = %location, error = %e, "Could not seed chart"),
        }
    }

    manager.start(now_millis());

    let mut stats_interval = tokio::time::interval(Duration::from_secs(5));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let wait = manager
            .next_deadline()
            .map_or(1_000, |d| d.saturating_sub(now_millis()));

        tokio::select! {
            Some(event) = socket_events.recv() => {
                if let Err(e) = manager.handle_socket_event(event, now_millis()) {
                    debug!(error = %e, "Event for a released channel");
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(wait)) => manager.tick(now_millis()),
            _ = stats_interval.tick() => {
                let snapshot = manager.snapshot(now_millis());
                for ch in &snapshot.channels {
                    info!(
                        channel = %ch.channel,
                        status = ?ch.status,
                        health = ?ch.health.level,
                        score = ch.health.score,
                        "stats"
                    );
                }
                for loc in &snapshot.locations {
                    info!(location = %loc.location_id, count = loc.count, timeframe = %loc.timeframe, "stats");
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    manager.stop(now_millis())?;
    Ok(())
}

#[cfg(target_arch = "wasm32")]
fn main() {}
