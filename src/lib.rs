//! stonemesh: nearest-node localisation core for BLE mesh switch nodes.
//!
//! Every node scans for advertising assets, admits the ones matching a
//! controller-managed filter set, and takes part in a mesh-wide election
//! that decides which node is closest to each asset. Reports travel over a
//! best-effort broadcast queue; results are streamed to a UART host as
//! NDJSON.
//!
//! The crate has no platform dependencies and is testable on any host with
//! `cargo test`. Firmware provides the radio, storage and UART through the
//! collaborator traits ([`mesh_queue::MeshTransport`],
//! [`config::ConfigStore`], [`comm::UartSink`], [`event::EventSink`]) and
//! drives a [`node::Node`].
//!
//! Modules, leaf first:
//! - `util`, `rssi`, `store`, `arena`: CRC, sequence numbers, compact RSSI
//!   and the bounded containers.
//! - `scanner`, `filter`, `cuckoo`, `parser`: advertisement parsing and
//!   filter admission.
//! - `tracker`, `forwarder`, `mesh_queue`: election, throttled forwarding and
//!   the outbound queue.
//! - `protocol`, `comm`: wire and UART formats.
//! - `event`, `node`: event bus and wiring.

#![cfg_attr(not(test), no_std)]

pub mod arena;
pub mod comm;
pub mod config;
pub mod cuckoo;
pub mod error;
pub mod event;
pub mod filter;
pub mod forwarder;
pub mod mesh_queue;
pub mod node;
pub mod parser;
pub mod protocol;
pub mod rssi;
pub mod scanner;
pub mod store;
pub mod tracker;
pub mod util;

pub use error::{Error, Result, ResultCode};
pub use node::Node;
