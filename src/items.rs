//! Item metadata lookup.
//!
//! The companion protocol only carries numeric item ids. A JSON database
//! (exported from the game's item manifest) maps those ids to display
//! names; when the database is missing or an id is unknown, formatting
//! falls back to a placeholder so a stale file never breaks a cycle.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Display metadata for one item id.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemInfo {
    pub name: String,
    #[serde(default)]
    pub shortname: String,
}

/// Read-only item metadata lookup.
pub trait ItemResolver: Send + Sync {
    fn resolve(&self, item_id: i32) -> Option<ItemInfo>;
}

/// Item database loaded once at startup from a JSON file keyed by
/// numeric item id.
#[derive(Debug, Default)]
pub struct ItemDatabase {
    items: HashMap<i32, ItemInfo>,
}

#[derive(Deserialize)]
struct RawDatabase {
    #[serde(default)]
    items: HashMap<String, ItemInfo>,
}

impl ItemDatabase {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read item database at {}", path.display()))?;
        let raw: RawDatabase = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse item database at {}", path.display()))?;
        let items = raw
            .items
            .into_iter()
            .filter_map(|(id, info)| id.parse::<i32>().ok().map(|id| (id, info)))
            .collect();
        Ok(Self { items })
    }

    /// Empty database; every lookup falls back to a placeholder.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a database from explicit entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (i32, ItemInfo)>) -> Self {
        Self {
            items: entries.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl ItemResolver for ItemDatabase {
    fn resolve(&self, item_id: i32) -> Option<ItemInfo> {
        self.items.get(&item_id).cloned()
    }
}

/// Display name for an item, with a stable placeholder for unknown ids.
pub fn item_label(resolver: &dyn ItemResolver, item_id: i32) -> String {
    resolver
        .resolve(item_id)
        .map(|info| info.name)
        .unwrap_or_else(|| format!("Item {item_id}"))
}

/// Short label used for currencies in chat lines, e.g. "scrap".
pub fn currency_label(resolver: &dyn ItemResolver, item_id: i32) -> String {
    match resolver.resolve(item_id) {
        Some(info) if !info.shortname.is_empty() => info.shortname,
        Some(info) => info.name,
        None => format!("Item {item_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database(json: &str) -> ItemDatabase {
        let raw: RawDatabase = serde_json::from_str(json).unwrap();
        let items = raw
            .items
            .into_iter()
            .filter_map(|(id, info)| id.parse::<i32>().ok().map(|id| (id, info)))
            .collect();
        ItemDatabase { items }
    }

    #[test]
    fn resolves_known_ids_including_negative() {
        let db = database(
            r#"{"items": {
                "-932201673": {"name": "Scrap", "shortname": "scrap"},
                "-1581843485": {"name": "Sulfur", "shortname": "sulfur"}
            }}"#,
        );
        assert_eq!(db.resolve(-932201673).unwrap().name, "Scrap");
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn unknown_id_gets_placeholder() {
        let db = ItemDatabase::empty();
        assert_eq!(item_label(&db, 123), "Item 123");
        assert_eq!(currency_label(&db, -5), "Item -5");
    }

    #[test]
    fn currency_prefers_shortname() {
        let db = database(r#"{"items": {"1": {"name": "High Quality Metal", "shortname": "hqm"}}}"#);
        assert_eq!(currency_label(&db, 1), "hqm");
        assert_eq!(item_label(&db, 1), "High Quality Metal");
    }

    #[test]
    fn non_numeric_keys_are_skipped() {
        let db = database(r#"{"items": {"oops": {"name": "Bad"}, "7": {"name": "Good"}}}"#);
        assert_eq!(db.len(), 1);
        assert_eq!(db.resolve(7).unwrap().name, "Good");
    }
}
