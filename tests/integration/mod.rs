//! Integration tests module
//!
//! End-to-end runs of the provisioning pipeline, through the library with
//! mock providers and through the `provision` binary.

pub mod cli;
pub mod common;
pub mod pipeline;
