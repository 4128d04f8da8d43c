//! Tunnelgate - a rendezvous server for exposing local services
//!
//! This library implements a tunnel server that:
//! - Hands out short public subdomain identifiers on request
//! - Opens a dedicated TCP listener per tunnel for the client's connections
//! - Routes public HTTP traffic by Host header to the owning tunnel
//! - Pairs each request with one free client connection, queueing overflow
//! - Streams request and response bytes verbatim in both directions
//! - Reaps reservations whose client never connects within a grace period

pub mod admin;
pub mod config;
pub mod error;
pub mod id;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod tunnel;
