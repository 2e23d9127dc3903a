//! Assertion helpers for scenarios.
//!
//! These are pure functions over document snapshots taken after a scenario
//! settles. They take state as input and return pass/fail.

use serde_json::Value;

/// One device's replica at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    /// Device name, for messages.
    pub name: String,
    /// Full document state, one JSON object per collection.
    pub document: Value,
}

impl DeviceSnapshot {
    /// Entry `key` of `collection`, if present.
    pub fn entry(&self, collection: &str, key: &str) -> Option<&Value> {
        self.document.get(collection)?.get(key)
    }
}

/// Result of an assertion check.
#[derive(Debug, Clone)]
pub struct AssertionResult {
    /// Whether the assertion passed
    pub passed: bool,
    /// Description of what was checked
    pub description: String,
    /// Details on failure
    pub failure_details: Option<String>,
}

impl AssertionResult {
    /// Create a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.into(),
            failure_details: None,
        }
    }

    /// Create a failing result.
    pub fn fail(description: &str, details: &str) -> Self {
        Self {
            passed: false,
            description: description.into(),
            failure_details: Some(details.into()),
        }
    }
}

/// Assert that every replica holds the same document.
pub fn assert_converged(snapshots: &[DeviceSnapshot]) -> AssertionResult {
    let Some(first) = snapshots.first() else {
        return AssertionResult::pass("Convergence check (no devices)");
    };
    for other in &snapshots[1..] {
        if other.document != first.document {
            let differing: Vec<&str> = collection_names(first, other)
                .into_iter()
                .filter(|c| first.document.get(c) != other.document.get(c))
                .collect();
            return AssertionResult::fail(
                "Convergence check",
                &format!(
                    "{} and {} differ in {}",
                    first.name,
                    other.name,
                    differing.join(", ")
                ),
            );
        }
    }
    AssertionResult::pass(&format!(
        "All {} replicas hold the same document",
        snapshots.len()
    ))
}

/// Assert that an entry is present on one replica.
pub fn assert_entry_present(
    snapshot: &DeviceSnapshot,
    collection: &str,
    key: &str,
) -> AssertionResult {
    if snapshot.entry(collection, key).is_some() {
        AssertionResult::pass(&format!(
            "{collection}/{key} present on {}",
            snapshot.name
        ))
    } else {
        AssertionResult::fail(
            &format!("{collection}/{key} should be present on {}", snapshot.name),
            "entry missing",
        )
    }
}

/// Assert that no write was lost: every `(collection, key)` written anywhere
/// is present on every replica.
pub fn assert_no_lost_writes(
    snapshots: &[DeviceSnapshot],
    written: &[(&str, &str)],
) -> AssertionResult {
    for snapshot in snapshots {
        let missing: Vec<String> = written
            .iter()
            .filter(|(collection, key)| snapshot.entry(collection, key).is_none())
            .map(|(collection, key)| format!("{collection}/{key}"))
            .collect();
        if !missing.is_empty() {
            return AssertionResult::fail(
                "No lost writes check",
                &format!("{} is missing {}", snapshot.name, missing.join(", ")),
            );
        }
    }
    AssertionResult::pass(&format!(
        "{} writes present on {} replicas",
        written.len(),
        snapshots.len()
    ))
}

fn collection_names<'a>(a: &'a DeviceSnapshot, b: &'a DeviceSnapshot) -> Vec<&'a str> {
    let mut names: Vec<&str> = [&a.document, &b.document]
        .into_iter()
        .filter_map(Value::as_object)
        .flat_map(|o| o.keys().map(String::as_str))
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(name: &str, document: Value) -> DeviceSnapshot {
        DeviceSnapshot {
            name: name.into(),
            document,
        }
    }

    #[test]
    fn identical_documents_converge() {
        let doc = json!({"tasks": {"t1": {"title": "Buy milk"}}});
        let result = assert_converged(&[snapshot("a", doc.clone()), snapshot("b", doc)]);
        assert!(result.passed);
    }

    #[test]
    fn divergence_names_the_collection() {
        let result = assert_converged(&[
            snapshot("a", json!({"tasks": {"t1": 1}, "events": {}})),
            snapshot("b", json!({"tasks": {}, "events": {}})),
        ]);
        assert!(!result.passed);
        let details = result.failure_details.unwrap();
        assert!(details.contains("tasks"));
        assert!(!details.contains("events"));
    }

    #[test]
    fn empty_topology_trivially_converges() {
        assert!(assert_converged(&[]).passed);
    }

    #[test]
    fn entry_presence() {
        let s = snapshot("a", json!({"tasks": {"t1": {"done": false}}}));
        assert!(assert_entry_present(&s, "tasks", "t1").passed);
        assert!(!assert_entry_present(&s, "tasks", "t2").passed);
        assert!(!assert_entry_present(&s, "calendars", "t1").passed);
    }

    #[test]
    fn lost_write_is_reported_with_device() {
        let snapshots = [
            snapshot("a", json!({"tasks": {"t1": 1, "t2": 2}})),
            snapshot("b", json!({"tasks": {"t1": 1}})),
        ];
        let result = assert_no_lost_writes(&snapshots, &[("tasks", "t1"), ("tasks", "t2")]);
        assert!(!result.passed);
        assert_eq!(
            result.failure_details.as_deref(),
            Some("b is missing tasks/t2")
        );
    }
}
