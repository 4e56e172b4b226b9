//! Occupancy live feed - real-time count reconciliation for dashboards
//!
//! Keeps one or more WebSocket channels to the analytics server alive,
//! re-establishes pattern subscriptions after every reconnect, routes inbound
//! frames to the locations that asked for them and folds raw readings into
//! counts that never go backwards.
//!
//! Everything below `manager` is sans-IO: state machines take `now` and return
//! what to do. `websocket_native` (tokio) and `websocket_wasm` (browser) are
//! the two drivers.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod events;
pub mod graphql;
pub mod manager;
pub mod registry;
pub mod time;
pub mod ws_state;

#[cfg(feature = "cli")]
pub mod websocket_native;

#[cfg(target_arch = "wasm32")]
pub mod websocket_wasm;

pub use crate::config::Settings;
pub use crate::core::{CountUpdate, Pattern, Timeframe};
pub use crate::error::{Error, Result};
pub use crate::events::DashboardEvent;
pub use crate::manager::{ConnectionManager, DashboardSnapshot, SocketEvent, Transport};
pub use crate::ws_state::{ChannelKey, ConnectionStatus};

#[cfg(target_arch = "wasm32")]
pub use web::LiveDashboard;

#[cfg(target_arch = "wasm32")]
mod web {
    use wasm_bindgen::prelude::*;

    use crate::time::now_millis;
    use crate::websocket_wasm::WasmTransport;
    use crate::{ChannelKey, ConnectionManager, Settings, Timeframe};

    #[wasm_bindgen(start)]
    pub fn init() {
        console_error_panic_hook::set_once();

        // Initialize tracing for browser console
        tracing_wasm::set_as_global_default();
    }

    fn to_js(e: crate::Error) -> JsValue {
        JsValue::from_str(&e.to_string())
    }

    fn parse_timeframe(timeframe: &str) -> Result<Timeframe, JsValue> {
        Timeframe::from_api(timeframe)
            .ok_or_else(|| JsValue::from_str(&format!("unknown timeframe {timeframe}")))
    }

    /// Page-facing handle. The page calls `poll` from a timer; events reach
    /// the callback registered with `on_event` as JSON strings.
    #[wasm_bindgen]
    pub struct LiveDashboard {
        manager: ConnectionManager<WasmTransport>,
    }

    #[wasm_bindgen]
    impl LiveDashboard {
        /// `settings_json` uses the same shape as the CLI config file; missing
        /// fields take their defaults.
        #[wasm_bindgen(constructor)]
        pub fn new(settings_json: Option<String>) -> Result<LiveDashboard, JsValue> {
            let settings: Settings = match settings_json {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| JsValue::from_str(&e.to_string()))?,
                None => Settings::default(),
            };
            settings.validate().map_err(to_js)?;
            Ok(Self {
                manager: ConnectionManager::new(settings, WasmTransport::new()),
            })
        }

        pub fn on_event(&mut self, callback: js_sys::Function) {
            self.manager.events().subscribe(move |event| {
                let Ok(json) = serde_json::to_string(event) else {
                    return;
                };
                if let Err(e) = callback.call1(&JsValue::NULL, &JsValue::from_str(&json)) {
                    tracing::warn!(?e, event = event.name(), "Event callback threw");
                }
            });
        }

        pub fn start(&mut self) {
            let now = now_millis();
            let settings = self.manager.settings().clone();
            for location in &settings.locations {
                self.manager.watch_location(location, settings.timeframe, now);
            }
            self.manager.start(now);
        }

        pub fn stop(&mut self) -> Result<(), JsValue> {
            self.manager.stop(now_millis()).map_err(to_js)
        }

        pub fn watch(&mut self, location_id: &str, timeframe: &str) -> Result<(), JsValue> {
            let timeframe = parse_timeframe(timeframe)?;
            self.manager.watch_location(location_id, timeframe, now_millis());
            Ok(())
        }

        pub fn unwatch(&mut self, location_id: &str) -> Result<(), JsValue> {
            self.manager
                .unwatch_location(location_id, now_millis())
                .map_err(to_js)
        }

        pub fn set_timeframe(&mut self, timeframe: &str) -> Result<(), JsValue> {
            let timeframe = parse_timeframe(timeframe)?;
            self.manager.set_global_timeframe(timeframe, now_millis());
            Ok(())
        }

        /// Retry the shared channel after it fell back.
        pub fn reconnect(&mut self) -> Result<(), JsValue> {
            self.manager
                .reconnect(&ChannelKey::Shared, now_millis())
                .map_err(to_js)
        }

        /// Apply queued socket events and run due timers.
        pub fn poll(&mut self) {
            let now = now_millis();
            for event in self.manager.transport().drain() {
                if let Err(e) = self.manager.handle_socket_event(event, now) {
                    tracing::debug!(error = %e, "Event for a released channel");
                }
            }
            self.manager.tick(now);
        }

        pub fn display_count(&self, location_id: &str) -> u64 {
            self.manager.display_count(location_id)
        }

        pub fn snapshot(&self) -> Result<String, JsValue> {
            serde_json::to_string(&self.manager.snapshot(now_millis()))
                .map_err(|e| JsValue::from_str(&e.to_string()))
        }
    }
}
