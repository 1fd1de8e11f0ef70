use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{CompetingOffer, Shop, UndercutFinding};

/// Split shops into ally and enemy sets by owner name.
///
/// A shop is ally iff its name contains `ally_prefix` case-insensitively.
/// An empty prefix matches nothing, so every shop is enemy. Shops with no
/// name are always enemy.
pub fn partition<'a>(shops: &'a [Shop], ally_prefix: &str) -> (Vec<&'a Shop>, Vec<&'a Shop>) {
    let needle = ally_prefix.to_lowercase();
    let mut ally = Vec::new();
    let mut enemy = Vec::new();
    for shop in shops {
        if !needle.is_empty() && shop.name.to_lowercase().contains(&needle) {
            ally.push(shop);
        } else {
            enemy.push(shop);
        }
    }
    (ally, enemy)
}

/// Find every ally listing that a stocked enemy listing meets or beats on
/// price per unit. A price tie counts as an undercut.
///
/// Competitors must sell the same item for the same currency and have at
/// least one unit in stock. Each finding lists its competitors ascending
/// by price per unit; the gap to the cheapest one is reported as an
/// absolute amount and a whole-number percentage of our price.
pub fn find_undercuts(ally: &[&Shop], enemy: &[&Shop]) -> Vec<UndercutFinding> {
    let mut findings = Vec::new();

    for shop in ally {
        for listing in &shop.listings {
            let Some(ally_ppu) = listing.price_per_unit() else {
                continue;
            };

            let mut competitors: Vec<CompetingOffer> = Vec::new();
            for rival in enemy {
                for offer in &rival.listings {
                    if offer.item_id != listing.item_id
                        || offer.currency_id != listing.currency_id
                        || offer.stock < 1
                    {
                        continue;
                    }
                    let Some(ppu) = offer.price_per_unit() else {
                        continue;
                    };
                    if ppu <= ally_ppu {
                        competitors.push(CompetingOffer {
                            shop_id: rival.id,
                            shop_name: rival.name.clone(),
                            x: rival.x,
                            y: rival.y,
                            price_per_unit: ppu,
                            stock: offer.stock,
                        });
                    }
                }
            }

            if competitors.is_empty() {
                continue;
            }
            competitors.sort_by(|a, b| a.price_per_unit.cmp(&b.price_per_unit));

            let undercut_amount = ally_ppu - competitors[0].price_per_unit;
            findings.push(UndercutFinding {
                key: shop.key_for(listing),
                shop_name: shop.name.clone(),
                x: shop.x,
                y: shop.y,
                item_id: listing.item_id,
                currency_id: listing.currency_id,
                ally_ppu,
                undercut_amount,
                undercut_pct: percentage_of(undercut_amount, ally_ppu),
                competitors,
            });
        }
    }

    findings
}

/// `part / whole` as a whole-number percentage, rounded half away from
/// zero. Zero when `whole` is zero.
fn percentage_of(part: Decimal, whole: Decimal) -> i64 {
    if whole.is_zero() {
        return 0;
    }
    (Decimal::ONE_HUNDRED * part / whole)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}
