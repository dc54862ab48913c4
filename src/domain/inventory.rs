//! Inventory data model: items, descriptors and the ranking rules
//!
//! `Inventory` is plain data plus the mutation rules. It is only ever
//! mutated by the store's writer task; see `services::inventory_store`.

use crate::domain::error::StoreError;
use crate::domain::types::SessionId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Category assigned when recognition gave up
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Shelf life used for items that never spoil (tools, instruments, ...)
pub const LONG_TERM_SHELF_LIFE_DAYS: u32 = 36_500;

/// Optimal temperature assumed when the classifier does not provide one
pub const DEFAULT_OPTIMAL_TEMP_C: f64 = 4.0;

/// Sections on every shelf level
pub const SECTIONS_PER_LEVEL: u8 = 4;

/// Items the fridge can hold at once
pub const FRIDGE_CAPACITY: usize = TemperatureZone::ALL.len() * SECTIONS_PER_LEVEL as usize;

/// Newtype wrapper for item IDs; unique and monotonically increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fridge shelves, coldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemperatureZone {
    DeepFreeze,
    Freeze,
    Chill,
    Fresh,
    Cool,
}

impl TemperatureZone {
    pub const ALL: [TemperatureZone; 5] = [
        TemperatureZone::DeepFreeze,
        TemperatureZone::Freeze,
        TemperatureZone::Chill,
        TemperatureZone::Fresh,
        TemperatureZone::Cool,
    ];

    pub fn celsius(&self) -> i32 {
        match self {
            TemperatureZone::DeepFreeze => -18,
            TemperatureZone::Freeze => -5,
            TemperatureZone::Chill => 2,
            TemperatureZone::Fresh => 6,
            TemperatureZone::Cool => 10,
        }
    }

    /// Shelf whose temperature is closest to `optimal_c`; ties go to the colder shelf
    pub fn nearest(optimal_c: f64) -> Self {
        let mut best = TemperatureZone::Chill;
        let mut best_diff = f64::INFINITY;
        for zone in Self::ALL {
            let diff = (zone.celsius() as f64 - optimal_c).abs();
            if diff < best_diff {
                best = zone;
                best_diff = diff;
            }
        }
        best
    }

    /// Every level ordered by temperature distance from `self`, `self` first;
    /// ties go to the colder level
    pub fn by_distance(self) -> [TemperatureZone; 5] {
        let mut levels = Self::ALL;
        levels.sort_by_key(|zone| (zone.celsius() - self.celsius()).abs());
        levels
    }
}

/// Structured classification result for a captured image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Classifier confidence in [0, 1]
    pub confidence: f32,
    pub shelf_life_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimal_temp_c: Option<f64>,
}

impl ItemDescriptor {
    pub fn new(category: impl Into<String>, confidence: f32, shelf_life_days: u32) -> Self {
        Self {
            category: category.into(),
            name: None,
            confidence: confidence.clamp(0.0, 1.0),
            shelf_life_days,
            optimal_temp_c: None,
        }
    }

    /// Descriptor used when classification failed; the item is still tracked
    pub fn fallback(default_shelf_life_days: u32) -> Self {
        Self::new(UNKNOWN_CATEGORY, 0.0, default_shelf_life_days)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_optimal_temp(mut self, celsius: f64) -> Self {
        self.optimal_temp_c = Some(celsius);
        self
    }

    pub fn is_unknown(&self) -> bool {
        normalize_category(&self.category) == UNKNOWN_CATEGORY
    }
}

/// A present item in the fridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: ItemId,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub confidence: f32,
    pub placed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Shelf level the item sits on
    pub temperature_zone: TemperatureZone,
    /// Section within the level, `0..SECTIONS_PER_LEVEL`
    #[serde(default)]
    pub section: u8,
    pub source_session_id: SessionId,
}

impl InventoryItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Ordering key for "use first": soonest expiry, then earliest placement, then id
    fn urgency_key(&self) -> (DateTime<Utc>, DateTime<Utc>, ItemId) {
        (self.expires_at, self.placed_at, self.id)
    }
}

/// Why a TAKE removed a particular item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TakeReason {
    /// Recognized category matched the item
    CategoryMatch,
    /// No category match; soonest-expiring item removed
    SoonestExpiry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Expired,
    ExpiringSoon,
    Fresh,
}

/// One ranked entry of `Inventory::recommend`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub item: InventoryItem,
    pub urgency: Urgency,
    /// Whole days until expiry (negative once expired)
    pub days_remaining: i64,
}

/// The item to point out to someone approaching the fridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub item_id: ItemId,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub urgency: Urgency,
    pub days_remaining: i64,
}

impl From<&Recommendation> for Suggestion {
    fn from(rec: &Recommendation) -> Self {
        Self {
            item_id: rec.item.id,
            category: rec.item.category.clone(),
            name: rec.item.name.clone(),
            urgency: rec.urgency,
            days_remaining: rec.days_remaining,
        }
    }
}

/// Lower-case, trimmed category used for matching
pub fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase()
}

/// Authoritative item set
#[derive(Debug, Clone)]
pub struct Inventory {
    items: BTreeMap<ItemId, InventoryItem>,
    next_id: u64,
}

impl Inventory {
    pub fn new() -> Self {
        Self { items: BTreeMap::new(), next_id: 1 }
    }

    /// Seed from a snapshot; the id counter resumes after the highest loaded id
    ///
    /// Items whose slot is out of range or already taken are moved to the
    /// nearest free slot; once the fridge is full the rest are dropped.
    pub fn from_items(items: Vec<InventoryItem>) -> Self {
        let mut inventory = Self::new();
        for mut item in items {
            if item.expires_at <= item.placed_at {
                warn!(item_id = %item.id, "snapshot_item_invalid_expiry_skipped");
                continue;
            }
            if inventory.items.contains_key(&item.id) {
                warn!(item_id = %item.id, "snapshot_item_duplicate_id_skipped");
                continue;
            }
            if item.section >= SECTIONS_PER_LEVEL || !inventory.is_free(item.temperature_zone, item.section) {
                let Some((zone, section)) = inventory.free_slot(item.temperature_zone) else {
                    warn!(item_id = %item.id, "snapshot_item_no_free_slot_skipped");
                    continue;
                };
                debug!(item_id = %item.id, zone = ?zone, section = %section, "snapshot_item_slot_reassigned");
                item.temperature_zone = zone;
                item.section = section;
            }
            inventory.next_id = inventory.next_id.max(item.id.0 + 1);
            inventory.items.insert(item.id, item);
        }
        inventory
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: ItemId) -> Option<&InventoryItem> {
        self.items.get(&id)
    }

    /// Items ordered by id (the snapshot order)
    pub fn items(&self) -> Vec<InventoryItem> {
        self.items.values().cloned().collect()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= FRIDGE_CAPACITY
    }

    /// Create an item from a recognition result
    ///
    /// The item goes into the first free section of the level closest to its
    /// optimal temperature, falling back to the nearest level with room.
    pub fn place(
        &mut self,
        descriptor: &ItemDescriptor,
        session_id: &SessionId,
        placed_at: DateTime<Utc>,
    ) -> Result<InventoryItem, StoreError> {
        let preferred =
            TemperatureZone::nearest(descriptor.optimal_temp_c.unwrap_or(DEFAULT_OPTIMAL_TEMP_C));
        let (zone, section) = self
            .free_slot(preferred)
            .ok_or(StoreError::Full { capacity: FRIDGE_CAPACITY })?;

        let id = ItemId(self.next_id);
        self.next_id += 1;

        // expires_at > placed_at must hold and the sum must stay representable
        let shelf_life_days = descriptor.shelf_life_days.clamp(1, LONG_TERM_SHELF_LIFE_DAYS);

        let item = InventoryItem {
            id,
            category: descriptor.category.clone(),
            name: descriptor.name.clone(),
            confidence: descriptor.confidence,
            placed_at,
            expires_at: placed_at + Duration::days(i64::from(shelf_life_days)),
            temperature_zone: zone,
            section,
            source_session_id: session_id.clone(),
        };
        self.items.insert(id, item.clone());
        Ok(item)
    }

    fn is_free(&self, zone: TemperatureZone, section: u8) -> bool {
        !self.items.values().any(|item| item.temperature_zone == zone && item.section == section)
    }

    fn free_slot(&self, preferred: TemperatureZone) -> Option<(TemperatureZone, u8)> {
        preferred.by_distance().into_iter().find_map(|zone| {
            (0..SECTIONS_PER_LEVEL)
                .find(|section| self.is_free(zone, *section))
                .map(|section| (zone, section))
        })
    }

    /// Pick the item a TAKE of `category` should remove, without removing it
    ///
    /// Exact category matches win over partial ones ("milk" vs "oat milk");
    /// within a match class the soonest-expiring item is chosen. An unknown
    /// category never matches and falls through to the soonest expiry.
    pub fn best_match(&self, category: &str) -> Option<(ItemId, TakeReason)> {
        let wanted = normalize_category(category);

        if !wanted.is_empty() && wanted != UNKNOWN_CATEGORY {
            let exact = self.soonest(|item| normalize_category(&item.category) == wanted);
            if let Some(id) = exact {
                return Some((id, TakeReason::CategoryMatch));
            }

            let partial = self.soonest(|item| {
                let have = normalize_category(&item.category);
                !have.is_empty() && (have.contains(&wanted) || wanted.contains(&have))
            });
            if let Some(id) = partial {
                return Some((id, TakeReason::CategoryMatch));
            }
        }

        self.soonest(|_| true).map(|id| (id, TakeReason::SoonestExpiry))
    }

    /// Remove the best match for `category`; `None` when the fridge is empty
    pub fn take_best_match(&mut self, category: &str) -> Option<(InventoryItem, TakeReason)> {
        let (id, reason) = self.best_match(category)?;
        self.items.remove(&id).map(|item| (item, reason))
    }

    /// Present items ranked by ascending expiry, ties by earliest placement
    pub fn recommend(&self, now: DateTime<Utc>, expiring_soon: Duration) -> Vec<Recommendation> {
        let mut ranked: Vec<&InventoryItem> = self.items.values().collect();
        ranked.sort_by_key(|item| item.urgency_key());

        ranked
            .into_iter()
            .map(|item| {
                let remaining = item.expires_at - now;
                let urgency = if item.is_expired(now) {
                    Urgency::Expired
                } else if remaining <= expiring_soon {
                    Urgency::ExpiringSoon
                } else {
                    Urgency::Fresh
                };
                Recommendation { item: item.clone(), urgency, days_remaining: remaining.num_days() }
            })
            .collect()
    }

    fn soonest<F>(&self, predicate: F) -> Option<ItemId>
    where
        F: Fn(&InventoryItem) -> bool,
    {
        self.items
            .values()
            .filter(|item| predicate(item))
            .min_by_key(|item| item.urgency_key())
            .map(|item| item.id)
    }
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn place(inv: &mut Inventory, category: &str, days: u32, at: DateTime<Utc>) -> InventoryItem {
        inv.place(&ItemDescriptor::new(category, 0.9, days), &SessionId::new(), at).unwrap()
    }

    #[test]
    fn test_place_sets_expiry_from_shelf_life() {
        let mut inv = Inventory::new();
        let item = place(&mut inv, "milk", 7, t0());

        assert_eq!(item.category, "milk");
        assert_eq!(item.expires_at, t0() + Duration::days(7));
        assert!(item.expires_at > item.placed_at);
    }

    #[test]
    fn test_zero_shelf_life_still_expires_after_placement() {
        let mut inv = Inventory::new();
        let item = place(&mut inv, "sushi", 0, t0());
        assert!(item.expires_at > item.placed_at);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut inv = Inventory::new();
        let a = place(&mut inv, "milk", 7, t0());
        let b = place(&mut inv, "eggs", 14, t0());
        inv.take_best_match("milk");
        let c = place(&mut inv, "cheese", 10, t0());

        assert!(a.id < b.id);
        assert!(b.id < c.id);
    }

    #[test]
    fn test_from_items_resumes_id_counter() {
        let mut inv = Inventory::new();
        place(&mut inv, "milk", 7, t0());
        place(&mut inv, "eggs", 14, t0());

        let mut reloaded = Inventory::from_items(inv.items());
        let next = place(&mut reloaded, "butter", 30, t0());
        assert_eq!(next.id, ItemId(3));
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn test_from_items_skips_duplicates_and_bad_expiry() {
        let mut inv = Inventory::new();
        let good = place(&mut inv, "milk", 7, t0());
        let mut bad = good.clone();
        bad.id = ItemId(9);
        bad.expires_at = bad.placed_at;

        let reloaded = Inventory::from_items(vec![good.clone(), good.clone(), bad]);
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_take_prefers_category_match() {
        let mut inv = Inventory::new();
        place(&mut inv, "milk", 2, t0());
        let cheese = place(&mut inv, "Cheese", 10, t0());

        let (taken, reason) = inv.take_best_match("cheese").unwrap();
        assert_eq!(taken.id, cheese.id);
        assert_eq!(reason, TakeReason::CategoryMatch);
    }

    #[test]
    fn test_take_partial_category_match() {
        let mut inv = Inventory::new();
        place(&mut inv, "cheese", 1, t0());
        let oat = place(&mut inv, "oat milk", 9, t0());

        let (taken, reason) = inv.take_best_match("milk").unwrap();
        assert_eq!(taken.id, oat.id);
        assert_eq!(reason, TakeReason::CategoryMatch);
    }

    #[test]
    fn test_take_without_match_removes_soonest_expiry() {
        let mut inv = Inventory::new();
        let milk = place(&mut inv, "milk", 2, t0());
        place(&mut inv, "cheese", 10, t0());

        let (taken, reason) = inv.take_best_match("watermelon").unwrap();
        assert_eq!(taken.id, milk.id);
        assert_eq!(reason, TakeReason::SoonestExpiry);
    }

    #[test]
    fn test_unknown_category_never_matches() {
        let mut inv = Inventory::new();
        place(&mut inv, UNKNOWN_CATEGORY, 30, t0());
        let milk = place(&mut inv, "milk", 2, t0());

        let (taken, reason) = inv.take_best_match(UNKNOWN_CATEGORY).unwrap();
        assert_eq!(taken.id, milk.id);
        assert_eq!(reason, TakeReason::SoonestExpiry);
    }

    #[test]
    fn test_soonest_expiry_tie_breaks_on_placement_then_id() {
        let mut inv = Inventory::new();
        // Same expiry instant, placed at different times
        let later = inv
            .place(&ItemDescriptor::new("a", 1.0, 2), &SessionId::new(), t0() + Duration::days(1))
            .unwrap();
        let earlier = inv.place(&ItemDescriptor::new("b", 1.0, 3), &SessionId::new(), t0()).unwrap();
        assert_eq!(later.expires_at, earlier.expires_at);

        let (taken, _) = inv.take_best_match("zzz").unwrap();
        assert_eq!(taken.id, earlier.id);

        // Identical timestamps fall back to the lower id
        let first = place(&mut inv, "c", 5, t0());
        let second = place(&mut inv, "d", 5, t0());
        inv.take_best_match("zzz"); // removes `later`
        let (taken, _) = inv.take_best_match("zzz").unwrap();
        assert_eq!(taken.id, first.id);
        assert_ne!(taken.id, second.id);
    }

    #[test]
    fn test_take_from_empty_inventory() {
        let mut inv = Inventory::new();
        assert!(inv.take_best_match("milk").is_none());
    }

    #[test]
    fn test_recommend_orders_and_flags() {
        let mut inv = Inventory::new();
        let cheese = place(&mut inv, "cheese", 10, t0());
        let milk = place(&mut inv, "milk", 2, t0());
        let yogurt = place(&mut inv, "yogurt", 1, t0());

        let now = t0() + Duration::hours(36);
        let ranked = inv.recommend(now, Duration::days(2));

        let ids: Vec<ItemId> = ranked.iter().map(|r| r.item.id).collect();
        assert_eq!(ids, vec![yogurt.id, milk.id, cheese.id]);
        assert_eq!(ranked[0].urgency, Urgency::Expired);
        assert_eq!(ranked[1].urgency, Urgency::ExpiringSoon);
        assert_eq!(ranked[2].urgency, Urgency::Fresh);
        assert_eq!(ranked[2].days_remaining, 8);

        // Flagged, never removed
        assert_eq!(inv.len(), 3);
    }

    #[test]
    fn test_nearest_temperature_zone() {
        assert_eq!(TemperatureZone::nearest(-20.0), TemperatureZone::DeepFreeze);
        assert_eq!(TemperatureZone::nearest(-4.0), TemperatureZone::Freeze);
        assert_eq!(TemperatureZone::nearest(DEFAULT_OPTIMAL_TEMP_C), TemperatureZone::Chill);
        assert_eq!(TemperatureZone::nearest(7.0), TemperatureZone::Fresh);
        assert_eq!(TemperatureZone::nearest(25.0), TemperatureZone::Cool);
    }

    #[test]
    fn test_descriptor_zone_applied_on_place() {
        let mut inv = Inventory::new();
        let desc = ItemDescriptor::new("ice cream", 0.8, 60).with_optimal_temp(-18.0);
        let item = inv.place(&desc, &SessionId::new(), t0()).unwrap();
        assert_eq!(item.temperature_zone, TemperatureZone::DeepFreeze);
    }

    #[test]
    fn test_huge_shelf_life_is_capped() {
        let mut inv = Inventory::new();
        let jam = place(&mut inv, "jam", u32::MAX, t0());
        assert_eq!(jam.expires_at, t0() + Duration::days(i64::from(LONG_TERM_SHELF_LIFE_DAYS)));

        let milk = place(&mut inv, "milk", 7, t0());
        assert_eq!(milk.expires_at, t0() + Duration::days(7));
    }

    #[test]
    fn test_sections_fill_preferred_level_first() {
        let mut inv = Inventory::new();
        let sections: Vec<(TemperatureZone, u8)> = (0..5)
            .map(|_| place(&mut inv, "milk", 7, t0()))
            .map(|item| (item.temperature_zone, item.section))
            .collect();

        assert_eq!(
            sections,
            vec![
                (TemperatureZone::Chill, 0),
                (TemperatureZone::Chill, 1),
                (TemperatureZone::Chill, 2),
                (TemperatureZone::Chill, 3),
                // Chill is 2 C; Fresh (6 C) is nearer than Freeze (-5 C)
                (TemperatureZone::Fresh, 0),
            ]
        );
    }

    #[test]
    fn test_take_frees_section() {
        let mut inv = Inventory::new();
        place(&mut inv, "milk", 7, t0());
        let eggs = place(&mut inv, "eggs", 14, t0());
        place(&mut inv, "cheese", 10, t0());

        inv.take_best_match("eggs");
        let butter = place(&mut inv, "butter", 30, t0());
        assert_eq!((butter.temperature_zone, butter.section), (eggs.temperature_zone, eggs.section));
    }

    #[test]
    fn test_full_fridge_rejects_place() {
        let mut inv = Inventory::new();
        for _ in 0..FRIDGE_CAPACITY {
            place(&mut inv, "soda", 90, t0());
        }
        assert!(inv.is_full());

        let result = inv.place(&ItemDescriptor::new("milk", 0.9, 7), &SessionId::new(), t0());
        assert_eq!(result, Err(StoreError::Full { capacity: FRIDGE_CAPACITY }));
        assert_eq!(inv.len(), FRIDGE_CAPACITY);

        // The rejected place did not consume an id
        inv.take_best_match("soda");
        let next = place(&mut inv, "milk", 7, t0());
        assert_eq!(next.id, ItemId(FRIDGE_CAPACITY as u64 + 1));
    }

    #[test]
    fn test_from_items_reassigns_clashing_sections() {
        let mut inv = Inventory::new();
        let a = place(&mut inv, "milk", 7, t0());
        let mut b = place(&mut inv, "eggs", 14, t0());
        // Snapshots written before sections existed load with section 0
        b.section = 0;
        let mut c = a.clone();
        c.id = ItemId(7);
        c.section = 9;

        let reloaded = Inventory::from_items(vec![a.clone(), b.clone(), c]);
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.get(a.id).unwrap().section, 0);
        assert_eq!(reloaded.get(b.id).unwrap().section, 1);
        assert_eq!(reloaded.get(ItemId(7)).unwrap().section, 2);
    }

    #[test]
    fn test_levels_by_distance() {
        assert_eq!(
            TemperatureZone::Chill.by_distance(),
            [
                TemperatureZone::Chill,
                TemperatureZone::Fresh,
                TemperatureZone::Freeze,
                TemperatureZone::Cool,
                TemperatureZone::DeepFreeze,
            ]
        );
    }

    #[test]
    fn test_fallback_descriptor() {
        let desc = ItemDescriptor::fallback(7);
        assert!(desc.is_unknown());
        assert_eq!(desc.confidence, 0.0);
        assert_eq!(desc.shelf_life_days, 7);
    }
}
