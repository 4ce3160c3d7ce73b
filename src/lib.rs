//! Relay Ingress - connection processing core for a multi-protocol relay proxy
//!
//! Every accepted connection runs through the same pipeline before a protocol
//! handler sees it: rate limiting, protocol sniffing, optional TLS
//! interception and, on multiplexed listeners, a mux session whose streams
//! each take the same path.
//!
//! ## Features
//!
//! - **Sniffing**: bounded, non-destructive TLS Client Hello detection
//! - **MITM**: on-demand leaf certificates signed by a configured CA, gated by
//!   a pluggable bypass evaluator
//! - **Multiplexing**: many flow-controlled streams over one transport with
//!   keepalive
//! - **Affinity**: stable hash-based upstream selection
//! - **Rate limiting**: named token-bucket limiters managed at runtime
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_ingress::{Options, PolicySnapshot, Registry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = Options::from_json(r#"{"sniffing": true, "readTimeout": "30s"}"#)?;
//!     let policy = PolicySnapshot::resolve(&options, &Registry::new())?;
//!     assert!(policy.sniffing);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `policy` - option parsing and snapshot resolution
//! - `sniff` / `rewind` - classification without consuming the stream
//! - `mitm` - CA material, leaf cache, interception
//! - `mux` - stream multiplexing
//! - `pipeline` / `server` - per-connection composition and the listener
//! - `registry` / `store` / `admin` - named limiters and bypass rule sets

// Core pipeline
pub mod config;
pub mod pipeline;
pub mod policy;
pub mod server;

// Stream plumbing
pub mod idle_timeout;
pub mod rewind;
pub mod sniff;
pub mod stats;

// Interception and multiplexing
pub mod mitm;
pub mod mux;

// Selection and admission
pub mod affinity;
pub mod rate_limiter;

// Named objects and runtime configuration
pub mod admin;
pub mod registry;
pub mod reload;
pub mod store;

// Re-export commonly used types

/// Configuration types
pub use config::ListenerConfig;
pub use policy::{Options, PolicyError, PolicySnapshot};
pub use reload::{PolicyHandle, ReloadError};
pub use store::{ConfigStore, GlobalConfig};

/// Pipeline
pub use pipeline::{
    AsyncStream, BoxedStream, ConnectionInfo, ConnectionPipeline, Disposition, Handoff,
    PipelineError,
};
pub use server::{Listener, ProtocolHandler};
pub use sniff::{ClientHello, SniffResult, Sniffer};

/// MITM types
pub use mitm::{
    BypassConfig, BypassDecision, BypassEvaluator, CaKeyPair, Interception, InterceptionError,
    MitmError, MitmInterceptor, MitmMaterial, StaticBypass,
};

/// Multiplexing
pub use mux::{MuxConfig, MuxError, Session, Stream};

/// Rate limiting and registry
pub use admin::{AdminError, RateLimiterAdmin};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterConfig, TokenBucketLimiter};
pub use registry::{Registry, RegistryError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
