//! JavaScript capability bridges for WASM.
//!
//! `JsStore` implements `KeyValueStore` and `JsMedium` implements
//! `BroadcastMedium` by calling synchronous JS functions supplied by the page,
//! normally thin wrappers over `localStorage` and a `BroadcastChannel`.
//!
//! Notifications flow the other way through `WasmPeer`: the page listens for
//! `storage` and `message` events itself and forwards them.

use poll_core::{BroadcastMedium, BusError, KeyValueStore, StoreError};
use wasm_bindgen::prelude::*;

/// Store bridge over three callbacks.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const store = new JsStore(
///   (key) => localStorage.getItem(key),
///   (key, value) => localStorage.setItem(key, value),
///   (key) => localStorage.removeItem(key),
/// );
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsStore {
    get_fn: js_sys::Function,
    set_fn: js_sys::Function,
    remove_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsStore {
    /// `get` returns a string, or null/undefined for a missing key.
    #[wasm_bindgen(constructor)]
    pub fn new(get_fn: js_sys::Function, set_fn: js_sys::Function, remove_fn: js_sys::Function) -> Self {
        Self {
            get_fn,
            set_fn,
            remove_fn,
        }
    }
}

impl KeyValueStore for JsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .get_fn
            .call1(&JsValue::NULL, &key.into())
            .map_err(js_err_to_store_err)?;
        Ok(value.as_string())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_fn
            .call2(&JsValue::NULL, &key.into(), &value.into())
            .map_err(js_err_to_store_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.remove_fn
            .call1(&JsValue::NULL, &key.into())
            .map_err(js_err_to_store_err)?;
        Ok(())
    }
}

/// Publish-only medium over one callback.
///
/// ```typescript
/// const channel = new BroadcastChannel(`${namespace}poll_channel`);
/// const medium = new JsMedium((text) => channel.postMessage(text));
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsMedium {
    post_fn: js_sys::Function,
}

#[wasm_bindgen]
impl JsMedium {
    #[wasm_bindgen(constructor)]
    pub fn new(post_fn: js_sys::Function) -> Self {
        Self { post_fn }
    }
}

impl BroadcastMedium for JsMedium {
    fn publish(&self, text: &str) -> Result<(), BusError> {
        self.post_fn
            .call1(&JsValue::NULL, &text.into())
            .map_err(|e| BusError::Closed(js_err_message(&e)))?;
        Ok(())
    }
}

fn js_err_message(err: &JsValue) -> String {
    err.as_string()
        .or_else(|| {
            js_sys::Reflect::get(err, &"message".into())
                .ok()
                .and_then(|v| v.as_string())
        })
        .unwrap_or_else(|| format!("{:?}", err))
}

/// Quota and security errors mean storage is unusable rather than a one-off failure.
fn js_err_to_store_err(err: JsValue) -> StoreError {
    let name = js_sys::Reflect::get(&err, &"name".into())
        .ok()
        .and_then(|v| v.as_string())
        .unwrap_or_default();
    let msg = js_err_message(&err);

    match name.as_str() {
        "QuotaExceededError" | "SecurityError" => StoreError::Unavailable(msg),
        _ => StoreError::Io(msg),
    }
}
