//! Thread-safety bounds that relax on WASM.
//!
//! On native targets capabilities are shared across Tokio worker threads and
//! must be `Send + Sync`. In the browser everything runs on one thread and the
//! JS-backed capabilities hold `js_sys::Function`s, which are neither.
//!
//! Uses `target_arch = "wasm32"` for conditional compilation instead of feature flags
//! to avoid Cargo's feature unification issues when building the workspace.

#[cfg(not(target_arch = "wasm32"))]
mod platform {
    /// `Send + Sync` on native targets.
    pub trait ThreadSafe: Send + Sync {}

    impl<T: Send + Sync + ?Sized> ThreadSafe for T {}
}

#[cfg(target_arch = "wasm32")]
mod platform {
    /// No bound on WASM (single-threaded).
    pub trait ThreadSafe {}

    impl<T: ?Sized> ThreadSafe for T {}
}

pub use platform::*;
