//! Shared helpers for the integration tests: an in-process server on an
//! ephemeral port, a raw HTTP/1.1 client, and fixture trees.

#![allow(dead_code)]

pub mod client;
pub mod filesystem;
pub mod server;

pub use client::{roundtrip, Reply, TestClient};
pub use filesystem::Fixture;
pub use server::start;
