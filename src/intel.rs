//! One market-intelligence cycle end to end: fetch markers, rebuild the
//! snapshot, partition, detect undercuts, track stock, decide what to
//! announce. Everything after the fetch is synchronous and pure state,
//! so the whole pipeline is testable without a server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::detect::{find_undercuts, partition};
use crate::items::ItemResolver;
use crate::market::{MarketCache, build_snapshot};
use crate::notify::{
    Announcer, MAX_SUMMARY_LINES, format_depletion, format_out_of_stock, format_undercut,
};
use crate::session::SessionHandle;
use crate::stock::StockTracker;
use crate::types::{CycleReport, CycleTrigger, ListingKey, MarketSnapshot};

/// Timeout for the marker fetch driving a cycle.
const MARKER_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Counter totals for the exit summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IntelStats {
    pub cycles: u64,
    pub undercuts_announced: u64,
    pub depletion_events: u64,
}

/// Market state shared across cycles: last snapshot, stock history,
/// announcement dedup. One instance lives for the whole run and survives
/// reconnects.
pub struct MarketIntel {
    resolver: Arc<dyn ItemResolver>,
    ally_prefix: String,
    bot_prefix: String,
    sweep_horizon: u64,
    cache: MarketCache,
    tracker: StockTracker,
    announcer: Announcer,
    cycle: AtomicU64,
    undercuts_announced: AtomicU64,
    depletion_events: AtomicU64,
}

impl MarketIntel {
    pub fn new(
        resolver: Arc<dyn ItemResolver>,
        ally_prefix: String,
        bot_prefix: String,
        sweep_horizon: u64,
    ) -> Self {
        Self {
            resolver,
            ally_prefix,
            bot_prefix,
            sweep_horizon,
            cache: MarketCache::new(),
            tracker: StockTracker::new(),
            announcer: Announcer::new(),
            cycle: AtomicU64::new(0),
            undercuts_announced: AtomicU64::new(0),
            depletion_events: AtomicU64::new(0),
        }
    }

    /// Run one refresh/detect cycle against a live session.
    ///
    /// On any failure the previous snapshot stays cached and untouched;
    /// the caller just tries again next tick.
    pub async fn run_cycle(
        &self,
        session: &SessionHandle,
        trigger: CycleTrigger,
        map_size: Option<u32>,
    ) -> Result<CycleReport> {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let raw = session.get_map_markers(MARKER_CALL_TIMEOUT).await?;
        let snapshot = Arc::new(build_snapshot(&raw, cycle)?);
        self.cache.store(snapshot.clone());
        Ok(self.digest(&snapshot, trigger, map_size))
    }

    /// Everything after the fetch: partition, detect, track, announce.
    fn digest(
        &self,
        snapshot: &MarketSnapshot,
        trigger: CycleTrigger,
        map_size: Option<u32>,
    ) -> CycleReport {
        let (ally, enemy) = partition(&snapshot.shops, &self.ally_prefix);
        let findings = find_undercuts(&ally, &enemy);

        // Stock history and depletion events cover ally listings only;
        // rival stock matters solely for competitor filtering above.
        let depletions = self.tracker.observe_shops(&ally, snapshot.cycle);
        self.tracker.sweep(snapshot.cycle, self.sweep_horizon);

        let present: Vec<ListingKey> = ally
            .iter()
            .flat_map(|shop| shop.listings.iter().map(|listing| shop.key_for(listing)))
            .collect();
        let fresh = self
            .announcer
            .announce_new(&findings, &present, snapshot.cycle);
        self.announcer.sweep(snapshot.cycle, self.sweep_horizon);

        let mut lines = Vec::with_capacity(fresh.len() + depletions.len());
        for finding in &fresh {
            lines.push(format_undercut(
                &self.bot_prefix,
                finding,
                self.resolver.as_ref(),
                map_size,
            ));
        }
        for event in &depletions {
            lines.push(format_depletion(
                &self.bot_prefix,
                event,
                self.resolver.as_ref(),
                map_size,
            ));
        }

        self.undercuts_announced
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);
        self.depletion_events
            .fetch_add(depletions.len() as u64, Ordering::Relaxed);

        let report = CycleReport {
            timestamp: snapshot.taken_at,
            trigger,
            cycle: snapshot.cycle,
            shop_count: snapshot.shops.len(),
            ally_shops: ally.len(),
            enemy_shops: enemy.len(),
            findings: findings.len(),
            depletions: depletions.len(),
            lines,
        };
        self.announcer.record_last(findings, depletions);
        report
    }

    /// Reply lines for `!undercut`: the standing findings from the last
    /// cycle, widest gap first. Answers from cached state, never the
    /// network.
    pub fn undercut_summary(&self, map_size: Option<u32>) -> Vec<String> {
        if self.cache.cached().is_none() {
            return vec![format!("{} no market data yet", self.bot_prefix)];
        }
        let mut findings = self.announcer.last_findings();
        if findings.is_empty() {
            return vec![format!("{} no ally listings are undercut", self.bot_prefix)];
        }
        findings.sort_by(|a, b| {
            b.undercut_pct
                .cmp(&a.undercut_pct)
                .then(b.undercut_amount.cmp(&a.undercut_amount))
        });
        let lines = findings
            .iter()
            .map(|finding| {
                format_undercut(&self.bot_prefix, finding, self.resolver.as_ref(), map_size)
            })
            .collect();
        self.cap_summary(lines)
    }

    /// Reply lines for `!stock`: ally listings currently at zero or
    /// negative stock in the cached snapshot.
    pub fn stock_summary(&self, map_size: Option<u32>) -> Vec<String> {
        let Some(snapshot) = self.cache.cached() else {
            return vec![format!("{} no market data yet", self.bot_prefix)];
        };
        let (ally, _) = partition(&snapshot.shops, &self.ally_prefix);
        let lines: Vec<String> = ally
            .iter()
            .flat_map(|shop| {
                shop.listings
                    .iter()
                    .filter(|listing| listing.stock <= 0)
                    .map(|listing| {
                        format_out_of_stock(
                            &self.bot_prefix,
                            shop,
                            listing,
                            self.resolver.as_ref(),
                            map_size,
                        )
                    })
            })
            .collect();
        if lines.is_empty() {
            return vec![format!("{} all ally listings in stock", self.bot_prefix)];
        }
        self.cap_summary(lines)
    }

    /// Last successful snapshot, if any cycle has completed.
    pub fn cached_snapshot(&self) -> Option<Arc<MarketSnapshot>> {
        self.cache.cached()
    }

    pub fn stats(&self) -> IntelStats {
        IntelStats {
            cycles: self.cycle.load(Ordering::Relaxed),
            undercuts_announced: self.undercuts_announced.load(Ordering::Relaxed),
            depletion_events: self.depletion_events.load(Ordering::Relaxed),
        }
    }

    fn cap_summary(&self, mut lines: Vec<String>) -> Vec<String> {
        if lines.len() > MAX_SUMMARY_LINES {
            let extra = lines.len() - MAX_SUMMARY_LINES;
            lines.truncate(MAX_SUMMARY_LINES);
            lines.push(format!("{} +{extra} more", self.bot_prefix));
        }
        lines
    }
}
