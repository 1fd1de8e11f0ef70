pub mod commands;
pub mod config;
pub mod detect;
pub mod grid;
pub mod intel;
pub mod items;
pub mod manager;
pub mod market;
pub mod notify;
pub mod pairing;
pub mod reporter;
pub mod session;
pub mod stock;
pub mod types;

/// Marker kind the companion server uses for vending machines in the
/// map-marker feed
pub const VENDING_MACHINE_MARKER: i64 = 3;

/// Default companion app port when a paired credential file predates the
/// port field
pub const DEFAULT_APP_PORT: u16 = 28082;

/// Env var the probe binaries read to find the paired credential file
pub const CREDENTIALS_VAR: &str = "VENDWATCH_CREDENTIALS";
