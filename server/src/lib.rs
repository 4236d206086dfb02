//! girder HTTP server.
//!
//! Glues the reactor core (`net`) to HTTP parsing (`protocol_http`) and
//! routing (`router`), and provides the configuration, logging, metrics,
//! and signal plumbing used by the `girder-server` binary.

pub mod config;
pub mod http_server;
pub mod logging;
pub mod metrics;
pub mod signal;
pub mod web_frame;

pub use config::Config;
pub use http_server::HttpServer;
pub use web_frame::{BoundServer, RequestContext, ServerHandle, WebFrame};
