//! Offline caching proxy for the Mind web app.
//!
//! Sits between the browser and the Mind origin and plays the part of the
//! app's service worker: every outgoing request is routed to a caching
//! strategy (or passed through), responses are kept in generation-tagged
//! cache stores, and new worker generations go through an install /
//! activate lifecycle that purges stale stores.

pub mod config;
pub mod control;
pub mod fetch;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod request;
pub mod response;
pub mod router;
pub mod strategy;

#[cfg(test)]
mod test_utils;
