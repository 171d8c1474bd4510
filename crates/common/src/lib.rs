//! Primitives shared by the load balancer service and its backend-side tools.

#![warn(clippy::pedantic)]

/// BBB API checksum computation and verification
pub mod checksum;

/// Recording upload token claims and header parsing
pub mod jwt;

/// Bounded retry with linear backoff
pub mod retry;

/// Secret types that prevent accidental logging
pub mod secret;

/// Identifier types
pub mod types;
