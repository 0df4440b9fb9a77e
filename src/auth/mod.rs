//! Broker credential renewal through a challenge/response auth server
//!
//! A node's end-user credentials never reach the broker: they are traded for a
//! short-lived token that is then used as the transport password.

pub mod token;

pub use token::{challenge_response, password_hash, TokenError, TokenFetcher, TokenSource};
