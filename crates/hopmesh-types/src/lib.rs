//! Core types for the hopmesh store-and-forward overlay.
//!
//! This crate defines the configuration structures and the shared error type
//! used by the wire layer, the kernel and the CLI. It contains no networking.

pub mod config;
pub mod error;
