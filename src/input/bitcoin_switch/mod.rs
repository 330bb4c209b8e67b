//! Bitcoin Switch input source.
//!
//! BTCPay's Bitcoin Switch point-of-sale plugin pushes `"<pin>-<seconds>"`
//! text frames over a WebSocket when a payment settles. The client keeps
//! that socket open and forwards messages for our relay pin to the
//! activation controller.

mod client;
mod message;

pub use client::BitcoinSwitchClient;
pub use message::{SwitchCommand, SwitchError, SwitchHandler, SwitchMessageError};
