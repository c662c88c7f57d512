//! napgrid-proxy — the function front door.
//!
//! Classifies each request by path prefix and either forwards it to the
//! function backend (sync), captures it into the function's queue
//! (async), or records a wake signal. Non-function traffic passes through.
//!
//! # Request flow
//!
//! ```text
//! request
//!   └── proxy_middleware
//!       ├── classify(path)
//!       ├── Wake   → touch activity → 204 / 404
//!       ├── Async  → capture → CustomRequest JSON → queue → 202 / 404
//!       ├── Sync   → touch → wait for ready pod → BackendTransport → mirrored response
//!       └── other  → next handler (/health, fallback 404)
//! ```

pub mod handler;
pub mod route;
pub mod router;
pub mod transport;

pub use handler::{FunctionProxy, ProxySettings, proxy_middleware};
pub use route::{FunctionRoute, InvocationMode, classify};
pub use router::build_router;
pub use transport::{
    BackendBody, BackendRequest, BackendTransport, HttpTransport, RetryPolicy, TransportError,
    is_hop_by_hop,
};
