use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::VENDING_MACHINE_MARKER;
use crate::types::{Listing, MarketSnapshot, Shop};

/// Build a market snapshot from a raw `getMapMarkers` response.
///
/// Only vending-machine markers are kept. A marker without an id cannot
/// be tracked across snapshots and is skipped with a warning; malformed
/// listing fields degrade per listing (quantity at least 1, price and
/// stock default to 0) so one broken marker never loses the rest.
pub fn build_snapshot(response: &Value, cycle: u64) -> Result<MarketSnapshot> {
    let markers = response
        .pointer("/mapMarkers/markers")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("marker response missing mapMarkers.markers"))?;

    let mut shops = Vec::new();
    for marker in markers {
        if marker.get("type").and_then(Value::as_i64) != Some(VENDING_MACHINE_MARKER) {
            continue;
        }
        match parse_shop(marker) {
            Some(shop) => shops.push(shop),
            None => warn!("skipping vending marker without an id"),
        }
    }

    Ok(MarketSnapshot {
        taken_at: Utc::now(),
        cycle,
        shops,
    })
}

fn parse_shop(marker: &Value) -> Option<Shop> {
    let id = marker.get("id").and_then(Value::as_u64)?;
    let name = marker
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let x = marker.get("x").and_then(Value::as_f64).unwrap_or(0.0);
    let y = marker.get("y").and_then(Value::as_f64).unwrap_or(0.0);
    let listings = marker
        .get("sellOrders")
        .and_then(Value::as_array)
        .map(|orders| orders.iter().map(parse_listing).collect())
        .unwrap_or_default();

    Some(Shop {
        id,
        name,
        x,
        y,
        listings,
    })
}

fn parse_listing(order: &Value) -> Listing {
    let int = |field: &str| order.get(field).and_then(Value::as_i64);
    Listing {
        item_id: int("itemId").unwrap_or(0) as i32,
        currency_id: int("currencyId").unwrap_or(0) as i32,
        quantity: int("quantity").unwrap_or(1).clamp(1, i32::MAX as i64) as i32,
        price: int("costPerItem").unwrap_or(0).clamp(0, i32::MAX as i64) as i32,
        stock: int("amountInStock")
            .unwrap_or(0)
            .clamp(i32::MIN as i64, i32::MAX as i64) as i32,
    }
}

/// Last successful snapshot, swapped whole so readers never see a
/// half-built view. Survives disconnects; chat summaries answer from it
/// while the link is down.
#[derive(Default)]
pub struct MarketCache {
    current: RwLock<Option<Arc<MarketSnapshot>>>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, snapshot: Arc<MarketSnapshot>) {
        *self.current.write() = Some(snapshot);
    }

    pub fn cached(&self) -> Option<Arc<MarketSnapshot>> {
        self.current.read().clone()
    }
}
