//! Testing utilities and mock implementations
//!
//! Lets connections and nodes run without a broker or an auth server.

pub mod mocks;

pub use mocks::*;
