//! HTTP-facing adapters: middleware and server plumbing.

pub mod middleware;
pub mod server;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use server::HttpServer;
