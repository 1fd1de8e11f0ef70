//! Probe: dump the map-marker feed of the paired companion server.
//!
//! Connects with the stored pairing credentials, prints the server info,
//! breaks the raw marker dump down by type, runs the same dump through
//! the typed snapshot parser, then listens for broadcasts for 30s.
//!
//! Credential file path comes from VENDWATCH_CREDENTIALS (default
//! server.json).

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

use vendwatch::grid::grid_label;
use vendwatch::market::build_snapshot;
use vendwatch::pairing::load_credentials;
use vendwatch::session::{self, SessionEvent};
use vendwatch::{CREDENTIALS_VAR, VENDING_MACHINE_MARKER};

const CALL_TIMEOUT: Duration = Duration::from_secs(15);
const LISTEN_FOR: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let path = std::env::var(CREDENTIALS_VAR).unwrap_or_else(|_| "server.json".to_string());
    let creds = load_credentials(Path::new(&path))?
        .with_context(|| format!("no credentials at {path} — pair a server first"))?;

    println!("=== Marker Probe ===");
    println!("Server: {}:{}", creds.host, creds.port);
    println!("Player: {}", creds.player_id);
    println!();

    let (session, mut events) = session::connect(&creds).await?;

    let info = session.get_info(CALL_TIMEOUT).await?;
    let info = info.get("info").cloned().unwrap_or(Value::Null);
    let map_size = info.get("mapSize").and_then(Value::as_u64).unwrap_or(0) as u32;
    println!("Name:     {}", info.get("name").and_then(Value::as_str).unwrap_or("?"));
    println!("Map size: {map_size}");
    println!(
        "Players:  {}/{}",
        info.get("players").and_then(Value::as_u64).unwrap_or(0),
        info.get("maxPlayers").and_then(Value::as_u64).unwrap_or(0),
    );
    println!();

    let raw = session.get_map_markers(CALL_TIMEOUT).await?;
    let markers = raw
        .pointer("/mapMarkers/markers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut by_type: HashMap<i64, usize> = HashMap::new();
    for marker in &markers {
        let kind = marker.get("type").and_then(Value::as_i64).unwrap_or(-1);
        *by_type.entry(kind).or_default() += 1;
    }
    let mut types: Vec<_> = by_type.into_iter().collect();
    types.sort();
    println!("=== Raw Markers ({}) ===", markers.len());
    for (kind, count) in &types {
        let tag = if *kind == VENDING_MACHINE_MARKER {
            " (vending machine)"
        } else {
            ""
        };
        println!("  type {kind}: {count}{tag}");
    }
    println!();

    let snapshot = build_snapshot(&raw, 0)?;
    println!("=== Parsed Shops ({}) ===", snapshot.shops.len());
    for shop in snapshot.shops.iter().take(20) {
        println!(
            "  [{}] {:?} — {} listing(s)",
            grid_label(shop.x, shop.y, map_size),
            shop.name,
            shop.listings.len(),
        );
    }
    if snapshot.shops.len() > 20 {
        println!("  ... and {} more", snapshot.shops.len() - 20);
    }
    println!();

    println!("=== Listening for broadcasts ({}s) ===", LISTEN_FOR.as_secs());
    let start = Instant::now();
    let mut chat = 0u64;
    let mut marker_pushes = 0u64;
    loop {
        let left = LISTEN_FOR.saturating_sub(start.elapsed());
        if left.is_zero() {
            break;
        }
        match tokio::time::timeout(left, events.recv()).await {
            Ok(Some(SessionEvent::TeamMessage(msg))) => {
                chat += 1;
                println!(
                    "[{:.1}s] chat  | {}: {}",
                    start.elapsed().as_secs_f64(),
                    msg.sender,
                    msg.message,
                );
            }
            Ok(Some(SessionEvent::MarkersChanged)) => {
                marker_pushes += 1;
                println!(
                    "[{:.1}s] push  | marker update",
                    start.elapsed().as_secs_f64(),
                );
            }
            Ok(Some(SessionEvent::Disconnected)) | Ok(None) => {
                println!("connection dropped");
                break;
            }
            Ok(Some(_)) => {}
            Err(_) => break,
        }
    }

    session.disconnect().await;

    println!();
    println!("=== Summary ===");
    println!("Chat messages:  {chat}");
    println!("Marker pushes:  {marker_pushes}");
    println!("=== Probe Complete ===");
    Ok(())
}
