//! Declarative analyser and listing descriptors.
//!
//! Column roles:
//! - *filtered* columns affect which statistics rows a source row belongs
//!   to (they appear in match descriptors);
//! - *depended* columns affect the computed value without changing
//!   membership;
//! - *fixed filters* gate inclusion outright — relevance then requires the
//!   row's membership to have flipped between the before and after images.
//!
//! The tracked-column set handed to each table's change trigger is
//! generated from this registry, so the trigger's previous-value capture
//! always covers what the analysers declare.

use crate::event::{ChangeEvent, ChangeOp};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use trellis_commons::Row;

#[derive(Debug, Clone)]
pub struct AnalyserDescriptor {
    /// Statistic kind this analyser maintains (`statistics.type`).
    pub statistic_type: &'static str,
    pub source_table: &'static str,
    pub filtered_columns: &'static [&'static str],
    pub depended_columns: &'static [&'static str],
    pub fixed_filters: &'static [(&'static str, Value)],
}

#[derive(Debug, Clone)]
pub struct ListingDescriptor {
    /// Listing kind (`listing.type`).
    pub listing_type: &'static str,
    pub source_table: &'static str,
    /// Columns that determine membership in the listing.
    pub membership_columns: &'static [&'static str],
    /// Statistic kinds whose dirtying also invalidates this listing
    /// (they feed its ranking).
    pub watched_statistics: &'static [&'static str],
}

static FIXED_PUBLISHED: &[(&str, Value)] =
    &[("published", Value::Bool(true)), ("deleted", Value::Bool(false))];

static ANALYSERS: &[AnalyserDescriptor] = &[
    AnalyserDescriptor {
        statistic_type: "story-date-range",
        source_table: "story",
        filtered_columns: &[],
        depended_columns: &["ptime"],
        fixed_filters: FIXED_PUBLISHED,
    },
    AnalyserDescriptor {
        statistic_type: "daily-activities",
        source_table: "story",
        filtered_columns: &["user_ids"],
        depended_columns: &["type", "ptime", "tags"],
        fixed_filters: FIXED_PUBLISHED,
    },
];

static LISTINGS: &[ListingDescriptor] = &[ListingDescriptor {
    listing_type: "news",
    source_table: "story",
    membership_columns: &["published", "ready", "public", "user_ids", "tags", "ptime", "deleted"],
    watched_statistics: &["daily-activities"],
}];

/// Immutable registry of every analyser and listing descriptor.
#[derive(Debug, Clone)]
pub struct InvalidationRegistry {
    analysers: &'static [AnalyserDescriptor],
    listings: &'static [ListingDescriptor],
}

impl InvalidationRegistry {
    pub fn standard() -> Self {
        InvalidationRegistry {
            analysers: ANALYSERS,
            listings: LISTINGS,
        }
    }

    pub fn analysers(&self) -> &[AnalyserDescriptor] {
        self.analysers
    }

    pub fn listings(&self) -> &[ListingDescriptor] {
        self.listings
    }

    /// Columns the change trigger on `table` must track so that every
    /// analyser and listing sees the previous values it needs.
    pub fn tracked_columns(&self, table: &str) -> BTreeSet<&'static str> {
        let mut out = BTreeSet::new();
        for a in self.analysers.iter().filter(|a| a.source_table == table) {
            out.extend(a.filtered_columns.iter().copied());
            out.extend(a.depended_columns.iter().copied());
            out.extend(a.fixed_filters.iter().map(|(c, _)| *c));
        }
        for l in self.listings.iter().filter(|l| l.source_table == table) {
            out.extend(l.membership_columns.iter().copied());
        }
        // Listings watch statistics rows through their change events
        if table == "statistics" && self.listings.iter().any(|l| !l.watched_statistics.is_empty())
        {
            out.extend(["type", "dirty"]);
        }
        out
    }

    /// Every table some descriptor draws from.
    pub fn source_tables(&self) -> BTreeSet<&'static str> {
        let mut out: BTreeSet<&'static str> = self
            .analysers
            .iter()
            .map(|a| a.source_table)
            .chain(self.listings.iter().map(|l| l.source_table))
            .collect();
        if self.listings.iter().any(|l| !l.watched_statistics.is_empty()) {
            out.insert("statistics");
        }
        out
    }
}

fn matches_fixed(filters: &[(&str, Value)], row: &Row) -> bool {
    filters.iter().all(|(column, expected)| {
        row.get(column).map_or(expected.is_null(), |v| v == expected)
    })
}

impl AnalyserDescriptor {
    /// Does this change affect the statistic? Membership flips on fixed
    /// filters always count; within membership, only filtered/depended
    /// columns do — unless nothing is declared, in which case any diff
    /// counts.
    pub fn is_relevant(&self, event: &ChangeEvent) -> bool {
        if event.table.as_str() != self.source_table {
            return false;
        }
        match event.op {
            ChangeOp::Insert | ChangeOp::Delete => {
                matches_fixed(self.fixed_filters, &event.current)
            }
            ChangeOp::Update => {
                let before = event.before_image();
                let was = matches_fixed(self.fixed_filters, &before);
                let is = matches_fixed(self.fixed_filters, &event.current);
                if was != is {
                    return true;
                }
                if !is {
                    // Outside the fixed filter before and after: irrelevant
                    return false;
                }
                if self.filtered_columns.is_empty()
                    && self.depended_columns.is_empty()
                    && self.fixed_filters.is_empty()
                {
                    return !event.diff.is_empty();
                }
                event.diff.iter().any(|c| {
                    self.filtered_columns.contains(&c.as_str())
                        || self.depended_columns.contains(&c.as_str())
                })
            }
        }
    }

    /// Candidate match values per filtered column, drawn from both the
    /// before and after images so rows leaving a bucket dirty it too.
    pub fn candidates(&self, event: &ChangeEvent) -> HashMap<String, Vec<Value>> {
        let before = event.before_image();
        let mut out = HashMap::new();
        for column in self.filtered_columns {
            let mut values: Vec<Value> = Vec::new();
            let mut push = |v: &Value| {
                if !values.contains(v) {
                    values.push(v.clone());
                }
            };
            for image in [&event.current, &before] {
                match image.get(column) {
                    Some(Value::Array(items)) => items.iter().for_each(&mut push),
                    Some(v) if !v.is_null() => push(v),
                    _ => {}
                }
            }
            out.insert((*column).to_string(), values);
        }
        out
    }
}

impl ListingDescriptor {
    /// Direct source-row path: a membership-determining column changed.
    pub fn is_relevant(&self, event: &ChangeEvent) -> bool {
        if event.table.as_str() != self.source_table {
            return false;
        }
        match event.op {
            ChangeOp::Insert | ChangeOp::Delete => true,
            ChangeOp::Update => event
                .diff
                .iter()
                .any(|c| self.membership_columns.contains(&c.as_str())),
        }
    }

    /// Statistics path: a statistic kind this listing ranks by went dirty.
    pub fn is_dirtied_by_statistic(&self, event: &ChangeEvent) -> bool {
        if event.table.as_str() != "statistics" {
            return false;
        }
        let went_dirty = event.current.get_bool("dirty") == Some(true)
            && (event.op == ChangeOp::Insert || event.changed("dirty"));
        went_dirty
            && event
                .current
                .get_str("type")
                .map_or(false, |t| self.watched_statistics.contains(&t))
    }
}

/// Does a derived row's match descriptor overlap the candidate values?
/// Filter keys with no candidate set are ignored (conservative: a filter
/// we cannot evaluate never suppresses an invalidation).
pub fn filters_overlap(filters: &Value, candidates: &HashMap<String, Vec<Value>>) -> bool {
    let map = match filters.as_object() {
        Some(map) => map,
        None => return true,
    };
    for (key, filter_value) in map {
        if let Some(values) = candidates.get(key) {
            let wanted: Vec<&Value> = match filter_value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            if !values.iter().any(|v| wanted.contains(&v)) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn daily_activities() -> &'static AnalyserDescriptor {
        ANALYSERS
            .iter()
            .find(|a| a.statistic_type == "daily-activities")
            .unwrap()
    }

    fn update_event(current: Value, previous: Value) -> ChangeEvent {
        ChangeEvent::parse(&json!({
            "op": "UPDATE",
            "schema": "acme",
            "table": "story",
            "current": current,
            "previous": previous
        }))
        .unwrap()
    }

    #[test]
    fn test_publish_flip_is_relevant() {
        // published flips false -> true for a row matching the fixed
        // filter afterwards
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "user_ids": [7]}),
            json!({"published": false}),
        );
        assert!(daily_activities().is_relevant(&event));
    }

    #[test]
    fn test_unpublished_change_is_irrelevant() {
        // published stays false throughout; membership never flips
        let event = update_event(
            json!({"id": 1, "published": false, "deleted": false, "user_ids": [7], "type": "post"}),
            json!({"type": "task-list"}),
        );
        assert!(!daily_activities().is_relevant(&event));
    }

    #[test]
    fn test_depended_column_change_within_membership() {
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "user_ids": [7], "type": "post"}),
            json!({"type": "task-list"}),
        );
        assert!(daily_activities().is_relevant(&event));
    }

    #[test]
    fn test_untracked_column_change_is_irrelevant() {
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "user_ids": [7], "public": true}),
            json!({"public": false}),
        );
        assert!(!daily_activities().is_relevant(&event));
    }

    #[test]
    fn test_soft_delete_flips_membership() {
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": true, "user_ids": [7]}),
            json!({"deleted": false}),
        );
        assert!(daily_activities().is_relevant(&event));
    }

    #[test]
    fn test_candidates_cover_both_images() {
        // Author 9 replaced author 7: both buckets must go dirty
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "user_ids": [9]}),
            json!({"user_ids": [7]}),
        );
        let candidates = daily_activities().candidates(&event);
        let user_ids = &candidates["user_ids"];
        assert!(user_ids.contains(&json!(9)));
        assert!(user_ids.contains(&json!(7)));
    }

    #[test]
    fn test_filters_overlap() {
        let mut candidates = HashMap::new();
        candidates.insert("user_ids".to_string(), vec![json!(7), json!(9)]);
        assert!(filters_overlap(&json!({"user_ids": [7]}), &candidates));
        assert!(!filters_overlap(&json!({"user_ids": [4]}), &candidates));
        // Project-wide stats row with no filters always matches
        assert!(filters_overlap(&json!({}), &candidates));
        // Filter keys without candidates are ignored
        assert!(filters_overlap(&json!({"tz_offset": 120}), &candidates));
    }

    #[test]
    fn test_listing_membership_relevance() {
        let listing = &LISTINGS[0];
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "user_ids": [7]}),
            json!({"published": false}),
        );
        assert!(listing.is_relevant(&event));
        let event = update_event(
            json!({"id": 1, "published": true, "deleted": false, "type": "post"}),
            json!({"type": "survey"}),
        );
        assert!(!listing.is_relevant(&event));
    }

    #[test]
    fn test_listing_watches_statistics_dirtying() {
        let listing = &LISTINGS[0];
        let event = ChangeEvent::parse(&json!({
            "op": "UPDATE",
            "schema": "acme",
            "table": "statistics",
            "current": {"id": 3, "type": "daily-activities", "dirty": true},
            "previous": {"dirty": false}
        }))
        .unwrap();
        assert!(listing.is_dirtied_by_statistic(&event));
        // Re-dirtying an already-dirty row arrives with no dirty diff
        let event = ChangeEvent::parse(&json!({
            "op": "UPDATE",
            "schema": "acme",
            "table": "statistics",
            "current": {"id": 3, "type": "daily-activities", "dirty": true},
            "previous": {"atime": null}
        }))
        .unwrap();
        assert!(!listing.is_dirtied_by_statistic(&event));
    }

    #[test]
    fn test_tracked_columns_cover_analyser_declarations() {
        let registry = InvalidationRegistry::standard();
        let tracked = registry.tracked_columns("story");
        for analyser in registry.analysers() {
            if analyser.source_table != "story" {
                continue;
            }
            for col in analyser
                .filtered_columns
                .iter()
                .chain(analyser.depended_columns)
                .chain(analyser.fixed_filters.iter().map(|(c, _)| c))
            {
                assert!(tracked.contains(col), "column {} not tracked", col);
            }
        }
        let tracked = registry.tracked_columns("statistics");
        assert!(tracked.contains("dirty"));
        assert!(tracked.contains("type"));
    }

    #[test]
    fn test_source_tables() {
        let registry = InvalidationRegistry::standard();
        let sources = registry.source_tables();
        assert!(sources.contains("story"));
        assert!(sources.contains("statistics"));
    }
}
