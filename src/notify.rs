//! Chat announcements: what gets said, once, and how fast.
//!
//! The announcer remembers which listing keys have already been called
//! out so a standing undercut is announced exactly once for as long as
//! the listing lives. Dispatch is strictly sequential with a paced delay
//! between lines; the in-game chat silently drops messages sent faster.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::warn;

use crate::grid::grid_label;
use crate::items::{ItemResolver, currency_label, item_label};
use crate::session::SessionHandle;
use crate::types::{ListingKey, StockDepletionEvent, UndercutFinding};

/// Timeout for one outbound chat send.
pub const CHAT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Most lines a single summary reply will produce before truncating.
pub const MAX_SUMMARY_LINES: usize = 5;

/// Allowed range for the delay between consecutive chat messages.
const MIN_NOTIFY_DELAY: f64 = 0.5;
const MAX_NOTIFY_DELAY: f64 = 5.0;

/// Clamp a configured inter-message delay into the allowed window.
/// Non-finite input falls back to one second.
pub fn clamp_notify_delay(secs: f64) -> Duration {
    if !secs.is_finite() {
        return Duration::from_secs(1);
    }
    Duration::from_secs_f64(secs.clamp(MIN_NOTIFY_DELAY, MAX_NOTIFY_DELAY))
}

/// Announcement dedup state plus the last computed results for on-demand
/// summaries.
#[derive(Default)]
pub struct Announcer {
    inner: Mutex<AnnouncerInner>,
}

#[derive(Default)]
struct AnnouncerInner {
    /// Listing key -> last cycle the listing was seen in a snapshot.
    announced: HashMap<ListingKey, u64>,
    last_findings: Vec<UndercutFinding>,
    last_depletions: Vec<StockDepletionEvent>,
}

impl Announcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter `findings` down to the ones not announced before, recording
    /// their keys.
    ///
    /// `present` must list every ally listing key in the current
    /// snapshot: keys stay fresh while their listing exists, so a
    /// standing undercut never re-announces. Once the listing disappears
    /// the key ages out via `sweep` and a later reappearance announces
    /// again.
    pub fn announce_new(
        &self,
        findings: &[UndercutFinding],
        present: &[ListingKey],
        cycle: u64,
    ) -> Vec<UndercutFinding> {
        let mut inner = self.inner.lock();
        for key in present {
            if let Some(seen) = inner.announced.get_mut(key) {
                *seen = cycle;
            }
        }

        let mut fresh = Vec::new();
        for finding in findings {
            match inner.announced.entry(finding.key) {
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(cycle);
                    fresh.push(finding.clone());
                }
            }
        }
        fresh
    }

    /// Drop keys whose listing has been gone for more than `horizon`
    /// cycles.
    pub fn sweep(&self, cycle: u64, horizon: u64) {
        self.inner
            .lock()
            .announced
            .retain(|_, seen| cycle.saturating_sub(*seen) <= horizon);
    }

    /// Store this cycle's full results for later summary queries.
    pub fn record_last(
        &self,
        findings: Vec<UndercutFinding>,
        depletions: Vec<StockDepletionEvent>,
    ) {
        let mut inner = self.inner.lock();
        inner.last_findings = findings;
        inner.last_depletions = depletions;
    }

    /// Findings from the most recent cycle, announced or not.
    pub fn last_findings(&self) -> Vec<UndercutFinding> {
        self.inner.lock().last_findings.clone()
    }

    /// Depletion events from the most recent cycle.
    pub fn last_depletions(&self) -> Vec<StockDepletionEvent> {
        self.inner.lock().last_depletions.clone()
    }

    /// Number of keys currently held against re-announcement.
    pub fn tracked(&self) -> usize {
        self.inner.lock().announced.len()
    }
}

/// Price per unit for chat: at most two decimals, trailing zeros dropped.
fn fmt_ppu(ppu: Decimal) -> String {
    ppu.round_dp(2).normalize().to_string()
}

/// " (D7)" when the map size is known, empty otherwise.
fn locate(x: f64, y: f64, map_size: Option<u32>) -> String {
    match map_size {
        Some(size) => format!(" ({})", grid_label(x, y, size)),
        None => String::new(),
    }
}

/// One chat line for an undercut finding.
pub fn format_undercut(
    prefix: &str,
    finding: &UndercutFinding,
    resolver: &dyn ItemResolver,
    map_size: Option<u32>,
) -> String {
    let item = item_label(resolver, finding.item_id);
    let currency = currency_label(resolver, finding.currency_id);
    let ours = format!(
        "{}{} asks {} {}/ea",
        finding.shop_name,
        locate(finding.x, finding.y, map_size),
        fmt_ppu(finding.ally_ppu),
        currency,
    );
    let theirs = match finding.competitors.first() {
        Some(best) => {
            let mut part = format!(
                "{}{} at {} (-{}%)",
                best.shop_name,
                locate(best.x, best.y, map_size),
                fmt_ppu(best.price_per_unit),
                finding.undercut_pct,
            );
            if finding.competitors.len() > 1 {
                part.push_str(&format!(", +{} more", finding.competitors.len() - 1));
            }
            part
        }
        None => "no rival listed".to_string(),
    };
    format!("{prefix} undercut: {item} — {ours}, {theirs}")
}

/// One chat line for a listing that is currently out of stock, used by
/// the `!stock` summary.
pub fn format_out_of_stock(
    prefix: &str,
    shop: &crate::types::Shop,
    listing: &crate::types::Listing,
    resolver: &dyn ItemResolver,
    map_size: Option<u32>,
) -> String {
    format!(
        "{prefix} out of stock: {} at {}{}",
        item_label(resolver, listing.item_id),
        shop.name,
        locate(shop.x, shop.y, map_size),
    )
}

/// One chat line for a stock depletion event.
pub fn format_depletion(
    prefix: &str,
    event: &StockDepletionEvent,
    resolver: &dyn ItemResolver,
    map_size: Option<u32>,
) -> String {
    format!(
        "{prefix} sold out: {} at {}{}, was {} in stock",
        item_label(resolver, event.key.item_id),
        event.shop_name,
        locate(event.x, event.y, map_size),
        event.previous_stock,
    )
}

/// Send each line as one team-chat message, pausing between sends.
///
/// A failed line is logged and skipped; the rest still go out. Returns
/// how many lines were delivered.
pub async fn dispatch_sequential(
    session: &SessionHandle,
    lines: &[String],
    delay: Duration,
) -> usize {
    let mut sent = 0;
    for (idx, line) in lines.iter().enumerate() {
        match session.send_team_message(line, CHAT_CALL_TIMEOUT).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(error = %e, line, "failed to send chat line"),
        }
        // Pace between messages, not after the last one.
        if idx + 1 < lines.len() {
            tokio::time::sleep(delay).await;
        }
    }
    sent
}
