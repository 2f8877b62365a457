pub mod client;

pub use client::{HelixClient, TwitchClientConfig, HELIX_MAX_BATCH};
