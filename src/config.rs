//! Runtime settings
//!
//! Every field has a default, so an empty document (or no config file at all)
//! yields a working setup. With the `cli` feature, [`load`] layers
//! `config/occupancy.{toml,yaml,json}` and `OCCUPANCY__*` environment
//! variables, then applies the `OCCUPANCY_WS` URL override.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::buffer::BufferPolicy;
use crate::cache::DEFAULT_ENTRIES_PER_KEY;
use crate::connection::{BackoffPolicy, HeartbeatPolicy};
use crate::core::{
    DownsampleStrategy, LabelMap, LocationId, Timeframe, DEFAULT_MAX_POINTS, MIN_MAX_POINTS,
};
use crate::error::{Error, Result};
use crate::registry::SubscriptionOptions;

/// Default analytics feed endpoint
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/ws/analytics";
pub const DEFAULT_GRAPHQL_URL: &str = "http://127.0.0.1:8080/graphql";

/// How logical channels map onto sockets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// One shared socket carries every subscription
    #[default]
    Multiplexed,
    /// One socket per watched (location, timeframe)
    PerLocation,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub url: String,
    pub mode: ChannelMode,
    pub backoff: BackoffPolicy,
    pub heartbeat: HeartbeatPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            mode: ChannelMode::default(),
            backoff: BackoffPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartStrategy {
    #[default]
    Peaks,
    Simplify,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChartSettings {
    pub strategy: ChartStrategy,
    pub max_points: usize,
    /// Douglas-Peucker tolerance, in count units
    pub tolerance: f64,
    /// Raw samples kept per series
    pub raw_history: usize,
}

impl Default for ChartSettings {
    fn default() -> Self {
        Self {
            strategy: ChartStrategy::Peaks,
            max_points: DEFAULT_MAX_POINTS,
            tolerance: 1.0,
            raw_history: 1_000,
        }
    }
}

impl ChartSettings {
    pub fn downsample_strategy(&self) -> DownsampleStrategy {
        match self.strategy {
            ChartStrategy::Peaks => DownsampleStrategy::Peaks {
                max_points: self.max_points,
            },
            ChartStrategy::Simplify => DownsampleStrategy::Simplify {
                tolerance: self.tolerance,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    pub live_count: SubscriptionOptions,
    pub chart_data: SubscriptionOptions,
    /// Also subscribe to chart_data for every watched location
    pub request_charts: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            live_count: SubscriptionOptions::every(5),
            chart_data: SubscriptionOptions::every(10).with_limit(15),
            request_charts: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub entries_per_key: usize,
    /// JSON snapshot restored on start and written on stop
    pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            entries_per_key: DEFAULT_ENTRIES_PER_KEY,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphqlSettings {
    pub endpoint: String,
}

impl Default for GraphqlSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GRAPHQL_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub buffer: BufferPolicy,
    pub chart: ChartSettings,
    pub subscriptions: SubscriptionSettings,
    /// Server label -> location ids, for aggregate frames
    pub labels: HashMap<String, Vec<LocationId>>,
    pub cache: CacheSettings,
    pub graphql: GraphqlSettings,
    /// Locations watched at startup
    pub locations: Vec<LocationId>,
    /// Timeframe selected at startup
    pub timeframe: Timeframe,
}

impl Default for Settings {
    fn default() -> Self {
        let labels = HashMap::from([
            (
                "تفتيش_الرجال".to_string(),
                vec!["northern-gate".to_string(), "men_region".to_string()],
            ),
            (
                "تفتيش_النساء".to_string(),
                vec!["womens-section".to_string(), "women_region".to_string()],
            ),
        ]);

        Self {
            connection: ConnectionSettings::default(),
            buffer: BufferPolicy::default(),
            chart: ChartSettings::default(),
            subscriptions: SubscriptionSettings::default(),
            labels,
            cache: CacheSettings::default(),
            graphql: GraphqlSettings::default(),
            locations: vec!["all".to_string()],
            timeframe: Timeframe::default(),
        }
    }
}

impl Settings {
    pub fn label_map(&self) -> LabelMap {
        LabelMap::new(self.labels.clone())
    }

    /// Reject values the components cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chart.strategy == ChartStrategy::Peaks && self.chart.max_points < MIN_MAX_POINTS {
            return Err(Error::Config(format!(
                "chart.max_points must be at least {MIN_MAX_POINTS}, got {}",
                self.chart.max_points
            )));
        }
        Ok(())
    }
}

/// Load settings from `config/occupancy` and the environment.
#[cfg(feature = "cli")]
pub fn load() -> Result<Settings> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name("config/occupancy").required(false))
        .add_source(
            config::Environment::with_prefix("OCCUPANCY")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut settings: Settings = builder
        .try_deserialize()
        .map_err(|e| Error::Config(e.to_string()))?;

    if let Ok(url) = std::env::var("OCCUPANCY_WS") {
        settings.connection.url = url;
    }
    settings.validate()?;
    Ok(settings)
}
