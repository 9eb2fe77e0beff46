//! Batch results and input normalization.
//!
//! Every bulk call partitions its input items into `Successful` and `Failed`.
//! The partition is maintained by construction: recording a failure evicts any
//! earlier success for the same item, and a success recorded after a failure is
//! ignored. Inputs arrive as a single identifier, a list, or a keyed mapping and
//! are normalized into an [`ItemSet`] before any remote call is made.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DmsError, DmsResult, ErrorKind};

/// Structured per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Taxonomy tag.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub detail: String,
}

impl ItemError {
    /// Create a new item error.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail)
    }
}

impl From<&DmsError> for ItemError {
    fn from(err: &DmsError) -> Self {
        match err {
            DmsError::ItemFailed { error, .. } => error.clone(),
            other => ItemError::new(other.kind(), other.to_string()),
        }
    }
}

impl From<DmsError> for ItemError {
    fn from(err: DmsError) -> Self {
        ItemError::from(&err)
    }
}

/// Partition of a batch's items into successes and failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<T, E = ItemError> {
    /// Items that succeeded, with their outcome value.
    #[serde(rename = "Successful")]
    pub successful: BTreeMap<String, T>,
    /// Items that failed, with their error.
    #[serde(rename = "Failed")]
    pub failed: BTreeMap<String, E>,
}

impl<T, E> Default for BatchResult<T, E> {
    fn default() -> Self {
        Self {
            successful: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}

impl<T, E> BatchResult<T, E> {
    /// Create an empty batch result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a success. Ignored (returns false) if the item already failed.
    pub fn succeed(&mut self, item: impl Into<String>, value: T) -> bool {
        let item = item.into();
        if self.failed.contains_key(&item) {
            return false;
        }
        self.successful.insert(item, value);
        true
    }

    /// Record a failure, evicting any earlier success for the item.
    pub fn fail(&mut self, item: impl Into<String>, error: E) {
        let item = item.into();
        self.successful.remove(&item);
        self.failed.insert(item, error);
    }

    /// Merge another batch into this one. Failures are applied first.
    pub fn merge(&mut self, other: BatchResult<T, E>) {
        for (item, error) in other.failed {
            self.fail(item, error);
        }
        for (item, value) in other.successful {
            self.succeed(item, value);
        }
    }

    /// Returns true if the item is in the successful partition.
    pub fn is_successful(&self, item: &str) -> bool {
        self.successful.contains_key(item)
    }

    /// Returns true if the item is in the failed partition.
    pub fn is_failed(&self, item: &str) -> bool {
        self.failed.contains_key(item)
    }

    /// Total number of items accounted for.
    pub fn len(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    /// Returns true if no item has been recorded.
    pub fn is_empty(&self) -> bool {
        self.successful.is_empty() && self.failed.is_empty()
    }

    /// Returns true if the batch failed nowhere.
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Returns true if the two partitions cover exactly `inputs` and are disjoint.
    pub fn covers<'a, I>(&self, inputs: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut expected = 0usize;
        for item in inputs {
            expected += 1;
            let in_ok = self.successful.contains_key(item);
            let in_failed = self.failed.contains_key(item);
            if in_ok == in_failed {
                return false;
            }
        }
        expected == self.len()
    }

    /// Transform every success value.
    pub fn map_values<U, F>(self, mut f: F) -> BatchResult<U, E>
    where
        F: FnMut(T) -> U,
    {
        BatchResult {
            successful: self
                .successful
                .into_iter()
                .map(|(k, v)| (k, f(v)))
                .collect(),
            failed: self.failed,
        }
    }

    /// Transform every failure.
    pub fn map_errors<F2, F>(self, mut f: F) -> BatchResult<T, F2>
    where
        F: FnMut(E) -> F2,
    {
        BatchResult {
            successful: self.successful,
            failed: self.failed.into_iter().map(|(k, e)| (k, f(e))).collect(),
        }
    }

    /// Rename items through `mapping` (e.g. PFN back to LFN). Unmapped items keep their key.
    pub fn remap_items(self, mapping: &BTreeMap<String, String>) -> BatchResult<T, E> {
        let mut out = BatchResult::new();
        for (item, error) in self.failed {
            let key = mapping.get(&item).cloned().unwrap_or(item);
            out.fail(key, error);
        }
        for (item, value) in self.successful {
            let key = mapping.get(&item).cloned().unwrap_or(item);
            out.succeed(key, value);
        }
        out
    }
}

impl<T> BatchResult<T, ItemError> {
    /// Record a failure from a [`DmsError`].
    pub fn fail_with(&mut self, item: impl Into<String>, error: &DmsError) {
        self.fail(item, ItemError::from(error));
    }

    /// Unwrap the outcome of one item into a direct value or error.
    pub fn into_single(mut self, item: &str) -> DmsResult<T> {
        if let Some(error) = self.failed.remove(item) {
            return Err(DmsError::ItemFailed {
                item: item.to_string(),
                error,
            });
        }
        self.successful
            .remove(item)
            .ok_or_else(|| DmsError::NotFound {
                item: item.to_string(),
            })
    }
}

/// The three accepted input shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Items {
    /// A single identifier.
    One(String),
    /// A list of identifiers.
    Many(Vec<String>),
    /// Identifiers with a per-item payload (link target, local path, source PFN, ...).
    Keyed(BTreeMap<String, String>),
}

impl From<&str> for Items {
    fn from(item: &str) -> Self {
        Items::One(item.to_string())
    }
}

impl From<String> for Items {
    fn from(item: String) -> Self {
        Items::One(item)
    }
}

impl From<Vec<String>> for Items {
    fn from(items: Vec<String>) -> Self {
        Items::Many(items)
    }
}

impl From<Vec<&str>> for Items {
    fn from(items: Vec<&str>) -> Self {
        Items::Many(items.into_iter().map(String::from).collect())
    }
}

impl From<&[String]> for Items {
    fn from(items: &[String]) -> Self {
        Items::Many(items.to_vec())
    }
}

impl From<BTreeMap<String, String>> for Items {
    fn from(items: BTreeMap<String, String>) -> Self {
        Items::Keyed(items)
    }
}

/// Canonical, non-empty, de-duplicated identifier set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemSet {
    entries: BTreeMap<String, Option<String>>,
}

impl ItemSet {
    /// Normalize any accepted input shape. Empty sets and blank identifiers are rejected.
    pub fn normalize(items: impl Into<Items>) -> DmsResult<Self> {
        let entries: BTreeMap<String, Option<String>> = match items.into() {
            Items::One(item) => std::iter::once((item, None)).collect(),
            Items::Many(list) => list.into_iter().map(|item| (item, None)).collect(),
            Items::Keyed(map) => map.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        };
        if entries.is_empty() {
            return Err(DmsError::invalid_input("no items supplied"));
        }
        if entries.keys().any(|k| k.trim().is_empty()) {
            return Err(DmsError::invalid_input("blank identifier supplied"));
        }
        Ok(Self { entries })
    }

    /// Identifiers in canonical order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Iterate over identifiers.
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Payload supplied with an identifier, if the keyed shape was used.
    pub fn payload(&self, id: &str) -> Option<&str> {
        self.entries.get(id).and_then(|p| p.as_deref())
    }

    /// Identifier to payload pairs, skipping identifiers without one.
    pub fn keyed(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Returns true if the identifier is in the set.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// The first identifier in canonical order.
    pub fn first(&self) -> Option<&str> {
        self.entries.keys().next().map(String::as_str)
    }

    /// Number of identifiers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a normalized set; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Render an outcome as the wire envelope:
/// `{"OK": true, "Value": ...}` or `{"OK": false, "Message": ..., "Kind": ...}`.
pub fn envelope<V: Serialize>(result: &DmsResult<V>) -> serde_json::Value {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => serde_json::json!({ "OK": true, "Value": value }),
            Err(e) => serde_json::json!({
                "OK": false,
                "Message": format!("failed to encode result: {}", e),
            }),
        },
        Err(err) => serde_json::json!({
            "OK": false,
            "Message": err.to_string(),
            "Kind": err.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_evicts_success() {
        let mut batch: BatchResult<u64> = BatchResult::new();
        batch.succeed("/grid/a", 10);
        batch.fail("/grid/a", ItemError::new(ErrorKind::NotFound, "gone"));
        assert!(!batch.is_successful("/grid/a"));
        assert!(batch.is_failed("/grid/a"));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_success_after_failure_ignored() {
        let mut batch: BatchResult<bool> = BatchResult::new();
        batch.fail("/grid/a", ItemError::new(ErrorKind::Io, "disk"));
        assert!(!batch.succeed("/grid/a", true));
        assert!(batch.is_failed("/grid/a"));
        assert!(batch.successful.is_empty());
    }

    #[test]
    fn test_merge_keeps_partition() {
        let mut left: BatchResult<bool> = BatchResult::new();
        left.succeed("a", true);
        left.succeed("b", true);
        let mut right: BatchResult<bool> = BatchResult::new();
        right.fail("b", ItemError::new(ErrorKind::Conflict, "guid"));
        right.succeed("c", true);
        left.merge(right);

        let inputs: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert!(left.covers(inputs.iter()));
        assert!(left.is_failed("b"));
    }

    #[test]
    fn test_covers_detects_missing_and_extra() {
        let mut batch: BatchResult<bool> = BatchResult::new();
        batch.succeed("a", true);
        let inputs: Vec<String> = vec!["a".into(), "b".into()];
        assert!(!batch.covers(inputs.iter()));

        batch.succeed("b", true);
        batch.succeed("z", true);
        assert!(!batch.covers(inputs.iter()));
    }

    #[test]
    fn test_remap_items() {
        let mut batch: BatchResult<u64> = BatchResult::new();
        batch.succeed("srm://se/a", 1);
        batch.fail("srm://se/b", ItemError::new(ErrorKind::Io, "x"));
        let mut mapping = BTreeMap::new();
        mapping.insert("srm://se/a".to_string(), "/grid/a".to_string());
        mapping.insert("srm://se/b".to_string(), "/grid/b".to_string());
        let batch = batch.remap_items(&mapping);
        assert!(batch.is_successful("/grid/a"));
        assert!(batch.is_failed("/grid/b"));
    }

    #[test]
    fn test_into_single() {
        let mut batch: BatchResult<u64> = BatchResult::new();
        batch.succeed("a", 7);
        assert_eq!(batch.into_single("a").unwrap(), 7);

        let mut batch: BatchResult<u64> = BatchResult::new();
        batch.fail("a", ItemError::new(ErrorKind::NotFound, "no such file"));
        let err = batch.into_single("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_normalize_shapes() {
        let one = ItemSet::normalize("/grid/a").unwrap();
        assert_eq!(one.ids(), vec!["/grid/a".to_string()]);

        let many = ItemSet::normalize(vec!["/grid/b", "/grid/a", "/grid/b"]).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many.first(), Some("/grid/a"));

        let mut map = BTreeMap::new();
        map.insert("/grid/link".to_string(), "/grid/target".to_string());
        let keyed = ItemSet::normalize(map).unwrap();
        assert_eq!(keyed.payload("/grid/link"), Some("/grid/target"));
    }

    #[test]
    fn test_normalize_rejects_empty() {
        let err = ItemSet::normalize(Vec::<String>::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = ItemSet::normalize("  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_envelope_shapes() {
        let mut batch: BatchResult<bool> = BatchResult::new();
        batch.succeed("a", true);
        let ok: DmsResult<BatchResult<bool>> = Ok(batch);
        let value = envelope(&ok);
        assert_eq!(value["OK"], true);
        assert_eq!(value["Value"]["Successful"]["a"], true);
        assert!(value["Value"]["Failed"].as_object().unwrap().is_empty());

        let err: DmsResult<BatchResult<bool>> = Err(DmsError::invalid_input("empty"));
        let value = envelope(&err);
        assert_eq!(value["OK"], false);
        assert_eq!(value["Kind"], "InvalidInput");
    }
}
