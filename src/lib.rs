//! Lightning Wash library.
//!
//! Pay-per-use washing machine control: paid time from BTCPay Server (or an
//! operator) turns into relay on-time, with at most one wash cycle active and
//! the relay always switched off when the cycle ends.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod input;
pub mod instance_lock;
pub mod invoice;
