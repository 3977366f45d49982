//! Core of a user-space ATA-over-Ethernet (AoE) target server.
//!
//! This crate implements the full request pipeline
//! except parsing an on-disk configuration file and choosing a logging
//! backend, both deliberately left to `main.rs` (or any other binary
//! built on top of this library).

pub mod acl;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod ctl;
pub mod device;
pub mod error;
pub mod eventloop;
pub mod logging;
pub mod netif;
pub mod netmon;
pub mod router;
pub mod state;
pub mod stats;
