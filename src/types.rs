use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Composite identity of one sell listing: vending machine, item sold,
/// currency asked. Stable across snapshots as long as the listing exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListingKey {
    pub shop_id: u64,
    pub item_id: i32,
    pub currency_id: i32,
}

/// One sell offer inside a vending machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub item_id: i32,
    pub currency_id: i32,
    /// Units handed over per transaction. Clamped to >= 1 at ingestion.
    pub quantity: i32,
    /// Currency units asked per transaction.
    pub price: i32,
    /// Remaining stock. Zero or negative means depleted.
    pub stock: i32,
}

impl Listing {
    /// Exact price per unit (price / quantity).
    ///
    /// Ingestion clamps quantity to >= 1; a listing constructed some other
    /// way with a smaller quantity yields `None` so it drops out of price
    /// comparison instead of faulting the cycle.
    pub fn price_per_unit(&self) -> Option<Decimal> {
        if self.quantity < 1 {
            return None;
        }
        Some(Decimal::from(self.price) / Decimal::from(self.quantity))
    }
}

/// A vending machine on the map with its current sell listings.
/// Rebuilt from scratch on every snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Shop {
    pub id: u64,
    /// Display name as broadcast by the server, trimmed. May be empty.
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub listings: Vec<Listing>,
}

impl Shop {
    /// Key identifying one of this shop's listings.
    pub fn key_for(&self, listing: &Listing) -> ListingKey {
        ListingKey {
            shop_id: self.id,
            item_id: listing.item_id,
            currency_id: listing.currency_id,
        }
    }
}

/// Point-in-time view of every vending machine on the map.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Monotonic refresh cycle that produced this snapshot.
    pub cycle: u64,
    pub shops: Vec<Shop>,
}

/// A rival listing priced at or below an ally listing's price per unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetingOffer {
    pub shop_id: u64,
    pub shop_name: String,
    pub x: f64,
    pub y: f64,
    pub price_per_unit: Decimal,
    pub stock: i32,
}

/// An ally listing that at least one stocked rival listing meets or beats
/// on price per unit.
#[derive(Debug, Clone, Serialize)]
pub struct UndercutFinding {
    pub key: ListingKey,
    pub shop_name: String,
    pub x: f64,
    pub y: f64,
    pub item_id: i32,
    pub currency_id: i32,
    pub ally_ppu: Decimal,
    /// Rivals at or below `ally_ppu`, ascending by price per unit.
    pub competitors: Vec<CompetingOffer>,
    /// How far the cheapest rival sits below us (zero on a price tie).
    pub undercut_amount: Decimal,
    /// Same gap as a whole-number percentage of our price.
    pub undercut_pct: i64,
}

/// A listing whose stock crossed from positive to depleted between two
/// consecutive observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockDepletionEvent {
    pub key: ListingKey,
    pub shop_name: String,
    pub x: f64,
    pub y: f64,
    pub previous_stock: i32,
    pub current_stock: i32,
}

/// One-time server info fetched right after a connection is established.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerInfo {
    pub name: String,
    pub map_size: u32,
    pub players: u32,
    pub max_players: u32,
}

/// Connection status published by the manager on every transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub connecting: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Retries scheduled since the last confirmed connection.
    pub reconnect_attempt: u32,
    pub server_info: Option<ServerInfo>,
}

/// What prompted a refresh cycle.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// First refresh after a connection came up.
    Startup,
    /// Regular interval tick.
    Scheduled,
}

/// Outcome of one refresh/detect cycle, emitted as a JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub trigger: CycleTrigger,
    pub cycle: u64,
    pub shop_count: usize,
    pub ally_shops: usize,
    pub enemy_shops: usize,
    /// Undercut findings in the current snapshot, announced or not.
    pub findings: usize,
    /// Depletion events detected this cycle.
    pub depletions: usize,
    /// Chat lines produced this cycle (new findings plus depletions).
    pub lines: Vec<String>,
}

/// Totals printed when the watcher exits.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cycles: u64,
    pub undercuts_announced: u64,
    pub depletion_events: u64,
    pub chat_lines_sent: u64,
}
