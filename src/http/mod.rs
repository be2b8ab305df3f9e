//! HTTP layer for the build-cache gateway.
//!
//! This module provides the axum-based server that accepts artifact uploads
//! and downloads keyed by hash, gates them behind the shared bearer token,
//! and translates object-store outcomes into status codes.

pub mod handler;
