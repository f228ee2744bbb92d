#[macro_use]
extern crate tracing;

pub mod asn;
pub mod capture;
pub mod classifier;
pub mod config;
pub mod delivery;
pub mod dns_cache;
pub mod event;
pub mod event_log;
pub mod filter;
pub mod ip_utils;
pub mod log;
pub mod parser;
pub mod persist;
pub mod pipeline;
pub mod ptr;
pub mod queue;
pub mod resolver;
pub mod rooms;
pub mod status;
pub mod threat;
