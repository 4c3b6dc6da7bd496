//! WASM bindings for poll-core.
//!
//! Runs one peer of the single-poller protocol inside a browser tab.
//!
//! # Architecture
//!
//! The page owns every browser API. It builds a `JsStore` over `localStorage`
//! and a `JsMedium` over a `BroadcastChannel`, then drives a `WasmPeer`:
//!
//! ```text
//! Page (TypeScript)                         WASM (Rust)
//! ─────────────────                         ───────────
//! localStorage ──callbacks──> JsStore ─┐
//! BroadcastChannel ─callback─> JsMedium ┴─> CoordinationEngine
//!                                                 ▲     │
//! storage / message events ──> WasmPeer ──────────┘     │
//! setTimeout / fetch  <────── effects (JSON array) <────┘
//! ```
//!
//! Every `WasmPeer` method returns the effects to perform: arm or clear a
//! timer, issue a poll and report back with `pollSucceeded`/`pollFailed`,
//! deliver data to the page, or flip the active-poller marker.
//!
//! **Note**: the bindings only compile for `wasm32` targets. Native builds get
//! the option parsing and nothing else.

pub mod options;

pub use options::PeerOptions;

#[cfg(target_arch = "wasm32")]
mod bridge;

#[cfg(target_arch = "wasm32")]
pub use bridge::{JsMedium, JsStore};

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::*;
    use poll_core::{
        AttemptId, BroadcastMessage, Clock, CoordinationEngine, Effect, PollError, StoreChange, SystemClock, TimerId,
    };
    use serde::Serialize;
    use std::cell::RefCell;
    use tracing::debug;
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// A tracing layer that hands each event to a JavaScript callback.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            LOGGER_CALLBACK.with(|cb| {
                let Some(callback) = cb.borrow().as_ref().cloned() else {
                    return;
                };
                let metadata = event.metadata();

                let mut visitor = MessageVisitor::default();
                event.record(&mut visitor);

                let timestamp = web_time::SystemTime::now()
                    .duration_since(web_time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as f64)
                    .unwrap_or(0.0);

                let js_event = js_sys::Object::new();
                let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.finish().into());
                let _ = js_sys::Reflect::set(&js_event, &"timestamp".into(), &timestamp.into());

                let _ = callback.call1(&JsValue::NULL, &js_event);
            });
        }
    }

    /// Collects the `message` field first, then `name=value` for the rest.
    #[derive(Default)]
    struct MessageVisitor {
        message: String,
        fields: Vec<String>,
    }

    impl MessageVisitor {
        fn finish(self) -> String {
            if self.fields.is_empty() {
                return self.message;
            }
            let fields = self.fields.join(" ");
            if self.message.is_empty() {
                fields
            } else {
                format!("{} {}", self.message, fields)
            }
        }
    }

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{:?}", value);
            } else {
                self.fields.push(format!("{}={:?}", field.name(), value));
            }
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "message" {
                self.message = value.to_string();
            } else {
                self.fields.push(format!("{}={}", field.name(), value));
            }
        }
    }

    /// Initialize the WASM module (panic hook and tracing).
    ///
    /// - `init()` - console-only logging
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    ///
    /// The logger callback receives `{ level, target, message, timestamp }`.
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let callback = config
            .as_ref()
            .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(tracing::Level::DEBUG)
            .build();

        match callback {
            Some(cb) => {
                LOGGER_CALLBACK.with(|cell| *cell.borrow_mut() = Some(cb));
                let subscriber = tracing_subscriber::registry()
                    .with(JsCallbackLayer)
                    .with(tracing_wasm::WASMLayer::new(console_config));
                tracing::subscriber::set_global_default(subscriber).ok();
            }
            None => tracing_wasm::set_as_global_default_with_config(console_config),
        }

        log("poll-wasm initialized");
    }

    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Generate a random 16-character hex peer ID.
    #[wasm_bindgen(js_name = generatePeerId)]
    pub fn generate_peer_id() -> String {
        poll_core::PeerId::generate().to_string()
    }

    #[wasm_bindgen]
    extern "C" {
        #[wasm_bindgen(js_namespace = console)]
        fn log(s: &str);
    }

    /// Serialize to plain JS objects and arrays (no `Map`s, numbers not `BigInt`s).
    fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsError> {
        value
            .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
            .map_err(|e| JsError::new(&e.to_string()))
    }

    /// One peer of the protocol, exposed to TypeScript.
    ///
    /// Effect arrays have the shape
    /// `{ type: "startTimer", id, kind, delayMs }`, `{ type: "cancelTimer", id }`,
    /// `{ type: "poll", attempt, endpoint, request }`, `{ type: "deliver", data }`
    /// or `{ type: "activeChanged", active }`.
    #[wasm_bindgen]
    pub struct WasmPeer {
        inner: RefCell<CoordinationEngine<JsStore, JsMedium>>,
    }

    #[wasm_bindgen]
    impl WasmPeer {
        /// Create a peer. Nothing is written until `start()`.
        ///
        /// `options` is `{ namespace, endpoint, pollIntervalMs?, lockLeaseMs?, disableLease?, counterTeardown? }`.
        #[wasm_bindgen(constructor)]
        pub fn new(options: JsValue, store: JsStore, medium: JsMedium) -> Result<WasmPeer, JsError> {
            let options: PeerOptions =
                serde_wasm_bindgen::from_value(options).map_err(|e| JsError::new(&format!("Invalid options: {}", e)))?;
            let config = options.into_config().map_err(|e| JsError::new(&e.to_string()))?;
            let engine = CoordinationEngine::with_entropy(config, store, medium).map_err(|e| JsError::new(&e.to_string()))?;

            Ok(WasmPeer {
                inner: RefCell::new(engine),
            })
        }

        #[wasm_bindgen(js_name = peerId)]
        pub fn peer_id(&self) -> String {
            self.inner.borrow().peer_id().to_string()
        }

        /// Register in the peer count and try to become the active poller.
        pub fn start(&self) -> Result<JsValue, JsError> {
            let effects = self.inner.borrow_mut().start(SystemClock.now_ms());
            to_js(&effects)
        }

        /// A timer from a `startTimer` effect expired.
        #[wasm_bindgen(js_name = fireTimer)]
        pub fn fire_timer(&self, id: f64) -> Result<JsValue, JsError> {
            let effects = self
                .inner
                .borrow_mut()
                .on_timer(TimerId::from(id as u64), SystemClock.now_ms());
            to_js(&effects)
        }

        /// The request from a `poll` effect returned `data`.
        #[wasm_bindgen(js_name = pollSucceeded)]
        pub fn poll_succeeded(&self, attempt: f64, data: JsValue) -> Result<JsValue, JsError> {
            let data: serde_json::Value =
                serde_wasm_bindgen::from_value(data).map_err(|e| JsError::new(&format!("Invalid poll data: {}", e)))?;
            self.complete(attempt, Ok(data))
        }

        /// The request from a `poll` effect failed.
        #[wasm_bindgen(js_name = pollFailed)]
        pub fn poll_failed(&self, attempt: f64, message: String) -> Result<JsValue, JsError> {
            self.complete(attempt, Err(PollError::Network(message)))
        }

        /// Forward a `storage` event (`key`, `oldValue`, `newValue`).
        #[wasm_bindgen(js_name = storageChanged)]
        pub fn storage_changed(
            &self,
            key: String,
            old_value: Option<String>,
            new_value: Option<String>,
        ) -> Result<JsValue, JsError> {
            let change = StoreChange {
                key,
                old_value,
                new_value,
            };
            let effects = self.inner.borrow_mut().on_storage_change(&change);
            to_js(&effects)
        }

        /// Forward the text of a channel `message` event.
        ///
        /// Malformed messages and unknown kinds yield no effects.
        #[wasm_bindgen(js_name = messageReceived)]
        pub fn message_received(&self, text: &str) -> Result<JsValue, JsError> {
            let message = match BroadcastMessage::decode(text) {
                Ok(BroadcastMessage::Unknown) => {
                    debug!("Ignoring message of unknown kind");
                    return to_js(&Vec::<Effect>::new());
                }
                Ok(message) => message,
                Err(e) => {
                    debug!("Ignoring malformed message: {}", e);
                    return to_js(&Vec::<Effect>::new());
                }
            };
            let effects = self.inner.borrow_mut().on_message(message);
            to_js(&effects)
        }

        /// `false` when `navigator.onLine` is false, `undefined` when unknown.
        #[wasm_bindgen(js_name = setNetworkState)]
        pub fn set_network_state(&self, online: Option<bool>) {
            self.inner.borrow_mut().set_network_available(online);
        }

        /// Rebuild the peer count from scratch.
        pub fn recount(&self) {
            self.inner.borrow_mut().recount();
        }

        /// Leave the namespace. Call from `beforeunload`; safe to call twice.
        pub fn teardown(&self) -> Result<JsValue, JsError> {
            let effects = self.inner.borrow_mut().teardown();
            to_js(&effects)
        }

        #[wasm_bindgen(js_name = isActive)]
        pub fn is_active(&self) -> bool {
            self.inner.borrow().is_active()
        }

        #[wasm_bindgen(js_name = isRunning)]
        pub fn is_running(&self) -> bool {
            self.inner.borrow().is_running()
        }

        #[wasm_bindgen(js_name = peerCount)]
        pub fn peer_count(&self) -> f64 {
            self.inner.borrow().peer_count() as f64
        }

        /// `{ peerId, state, active, peerCount, lock }`
        pub fn status(&self) -> Result<JsValue, JsError> {
            to_js(&self.inner.borrow().status())
        }
    }

    impl WasmPeer {
        fn complete(&self, attempt: f64, result: Result<serde_json::Value, PollError>) -> Result<JsValue, JsError> {
            let effects =
                self.inner
                    .borrow_mut()
                    .on_poll_complete(AttemptId::from(attempt as u64), result, SystemClock.now_ms());
            to_js(&effects)
        }
    }
}

// Re-export wasm_impl contents at crate root for wasm32 targets
#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
