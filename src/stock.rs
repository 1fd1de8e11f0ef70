use std::collections::HashMap;
use std::collections::hash_map::Entry;

use parking_lot::Mutex;

use crate::types::{Listing, ListingKey, Shop, StockDepletionEvent};

/// Remembers the last observed stock per listing and reports the moment a
/// listing crosses from positive stock to depleted.
///
/// The first observation of a key never produces an event, whatever the
/// stock is. Every observation overwrites the remembered value, so a
/// restocked listing can deplete again and fire again.
#[derive(Default)]
pub struct StockTracker {
    inner: Mutex<HashMap<ListingKey, StockEntry>>,
}

struct StockEntry {
    stock: i32,
    last_seen: u64,
}

impl StockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one listing. Returns the depletion event if its stock went
    /// from positive at the previous observation to zero or below now.
    pub fn observe(&self, shop: &Shop, listing: &Listing, cycle: u64) -> Option<StockDepletionEvent> {
        let mut map = self.inner.lock();
        Self::observe_entry(&mut map, shop, listing, cycle)
    }

    /// Observe every listing of the given shops under one lock.
    pub fn observe_shops(&self, shops: &[&Shop], cycle: u64) -> Vec<StockDepletionEvent> {
        let mut map = self.inner.lock();
        let mut events = Vec::new();
        for shop in shops {
            for listing in &shop.listings {
                if let Some(event) = Self::observe_entry(&mut map, shop, listing, cycle) {
                    events.push(event);
                }
            }
        }
        events
    }

    fn observe_entry(
        map: &mut HashMap<ListingKey, StockEntry>,
        shop: &Shop,
        listing: &Listing,
        cycle: u64,
    ) -> Option<StockDepletionEvent> {
        let key = shop.key_for(listing);
        match map.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(StockEntry {
                    stock: listing.stock,
                    last_seen: cycle,
                });
                None
            }
            Entry::Occupied(mut slot) => {
                let previous = slot.get().stock;
                slot.insert(StockEntry {
                    stock: listing.stock,
                    last_seen: cycle,
                });
                if previous > 0 && listing.stock <= 0 {
                    Some(StockDepletionEvent {
                        key,
                        shop_name: shop.name.clone(),
                        x: shop.x,
                        y: shop.y,
                        previous_stock: previous,
                        current_stock: listing.stock,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Forget keys not observed for more than `horizon` cycles, keeping
    /// the map bounded by the live listing population.
    pub fn sweep(&self, cycle: u64, horizon: u64) {
        self.inner
            .lock()
            .retain(|_, entry| cycle.saturating_sub(entry.last_seen) <= horizon);
    }

    /// Number of listing keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Listing;

    fn shop_with_stock(stock: i32) -> Shop {
        Shop {
            id: 1,
            name: "TeamShop".to_string(),
            x: 0.0,
            y: 0.0,
            listings: vec![Listing {
                item_id: 10,
                currency_id: 2,
                quantity: 1,
                price: 50,
                stock,
            }],
        }
    }

    fn observe(tracker: &StockTracker, stock: i32, cycle: u64) -> Option<StockDepletionEvent> {
        let shop = shop_with_stock(stock);
        tracker.observe(&shop, &shop.listings[0], cycle)
    }

    #[test]
    fn first_observation_never_fires() {
        let tracker = StockTracker::new();
        assert!(observe(&tracker, 0, 1).is_none());

        let tracker = StockTracker::new();
        assert!(observe(&tracker, 12, 1).is_none());
    }

    #[test]
    fn positive_to_zero_fires_once() {
        let tracker = StockTracker::new();
        assert!(observe(&tracker, 4, 1).is_none());
        let event = observe(&tracker, 0, 2).unwrap();
        assert_eq!(event.previous_stock, 4);
        assert_eq!(event.current_stock, 0);
        // Still depleted next cycle: no repeat event.
        assert!(observe(&tracker, 0, 3).is_none());
    }

    #[test]
    fn restock_and_second_depletion_fires_again() {
        let tracker = StockTracker::new();
        assert!(observe(&tracker, 4, 1).is_none());
        assert!(observe(&tracker, 0, 2).is_some());
        assert!(observe(&tracker, 2, 3).is_none());
        let second = observe(&tracker, 0, 4).unwrap();
        assert_eq!(second.previous_stock, 2);
    }

    #[test]
    fn negative_stock_counts_as_depleted() {
        let tracker = StockTracker::new();
        assert!(observe(&tracker, 3, 1).is_none());
        let event = observe(&tracker, -1, 2).unwrap();
        assert_eq!(event.current_stock, -1);
        // Depleted to depleted is silent.
        assert!(observe(&tracker, 0, 3).is_none());
    }

    #[test]
    fn observe_shops_reports_each_depleted_listing() {
        let tracker = StockTracker::new();
        let full = Shop {
            id: 1,
            name: "TeamShop".to_string(),
            x: 0.0,
            y: 0.0,
            listings: vec![
                Listing {
                    item_id: 10,
                    currency_id: 2,
                    quantity: 1,
                    price: 50,
                    stock: 5,
                },
                Listing {
                    item_id: 11,
                    currency_id: 2,
                    quantity: 1,
                    price: 20,
                    stock: 3,
                },
            ],
        };
        assert!(tracker.observe_shops(&[&full], 1).is_empty());

        let mut drained = full.clone();
        drained.listings[0].stock = 0;
        drained.listings[1].stock = 0;
        let events = tracker.observe_shops(&[&drained], 2);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn sweep_forgets_idle_keys() {
        let tracker = StockTracker::new();
        observe(&tracker, 5, 1);
        assert_eq!(tracker.tracked(), 1);

        // Within the horizon the key survives.
        tracker.sweep(100, 120);
        assert_eq!(tracker.tracked(), 1);

        // Past it the key is dropped; the next sighting is a fresh first
        // observation and stays silent even at stock zero.
        tracker.sweep(200, 120);
        assert_eq!(tracker.tracked(), 0);
        assert!(observe(&tracker, 0, 201).is_none());
    }
}
