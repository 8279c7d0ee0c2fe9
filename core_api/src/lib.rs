//! Client core shared by the Pairing and Sign APIs: durable storage,
//! heartbeat, persisted stores, expirations, JSON-RPC history and the
//! keychain backed crypto.

pub mod crypto;
pub mod error;
pub mod expirer;
pub mod heartbeat;
pub mod history;
pub mod storage;
pub mod store;
pub mod time;

pub use error::{Error, Result};
