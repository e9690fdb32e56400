//! clusterview - cluster topology backend
//!
//! Discovers the components of a distributed SQL database cluster from its
//! coordination store and controller API, inventories the hosts they run
//! on, and keeps a local failover TCP proxy pointed at a live SQL engine.

pub mod config;
pub mod coordination;
pub mod error;
pub mod fileswap;
pub mod hostinfo;
pub mod httpc;
pub mod proxy;
pub mod service;
pub mod stats;
pub mod topology;
pub mod utils;
