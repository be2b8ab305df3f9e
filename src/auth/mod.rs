//! Authentication for the cache routes.
//!
//! A single shared bearer token, configured at start-up, guards every cache
//! read and write.

pub mod middleware;
