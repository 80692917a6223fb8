//! Transport: the serving loop and the unary client.

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::StopMode;
