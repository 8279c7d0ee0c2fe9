//! Wire-level types shared by every WalletConnect client crate: domain
//! identifiers, relay JSON-RPC envelopes, Sign/Pairing API parameters and
//! relay authentication.

pub mod auth;
pub mod domain;
pub mod rpc;
