//! Attendance decision policy.
//!
//! Given one recognizer prediction, decide what name to show, which marker to
//! draw, and whether the person gets a new attendance mark this session.

use crate::annotate::Marker;
use crate::identity::IdentityMap;
use crate::types::{AttendanceRecord, Prediction, Resolved};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;

/// Predictions with a distance strictly below this are accepted.
pub const ACCEPT_THRESHOLD: f64 = 70.0;

/// Names marked during the current session, in the order they were marked.
#[derive(Debug, Clone, Default)]
pub struct SessionLedger {
    records: Vec<AttendanceRecord>,
    names: HashSet<String>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` at `timestamp`. Returns `false` if the name is already present.
    pub fn insert(&mut self, name: &str, timestamp: NaiveDateTime) -> bool {
        if !self.names.insert(name.to_string()) {
            return false;
        }
        self.records.push(AttendanceRecord::new(name, timestamp));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.names.clear();
    }
}

/// Names already present in the persisted ledger for one calendar date.
///
/// Snapshot taken at session start and never refreshed mid-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAttendanceIndex {
    date: NaiveDate,
    names: HashSet<String>,
}

impl DailyAttendanceIndex {
    pub fn new(date: NaiveDate, names: HashSet<String>) -> Self {
        Self { date, names }
    }

    pub fn empty(date: NaiveDate) -> Self {
        Self::new(date, HashSet::new())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &HashSet<String> {
        &self.names
    }
}

/// What happened to the session state as a result of one decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Distance at or above the threshold.
    Rejected,
    /// Accepted, but the label has no name in the identity map.
    UnknownIdentity,
    /// Already marked earlier in this session.
    AlreadyInSession,
    /// Already present in the persisted ledger for today.
    AlreadyMarkedToday,
    /// Newly added to the session ledger.
    Marked(AttendanceRecord),
}

/// Result of applying the policy to one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub name: Resolved,
    pub marker: Marker,
    pub outcome: Outcome,
}

pub fn is_accepted(confidence: f64) -> bool {
    confidence < ACCEPT_THRESHOLD
}

/// Apply the attendance policy to one prediction.
///
/// Only the `Marked` outcome mutates `ledger`.
pub fn decide(
    prediction: &Prediction,
    identities: &IdentityMap,
    ledger: &mut SessionLedger,
    today: &DailyAttendanceIndex,
    now: NaiveDateTime,
) -> Decision {
    if !is_accepted(prediction.confidence) {
        return Decision {
            name: Resolved::Unknown,
            marker: Marker::Reject,
            outcome: Outcome::Rejected,
        };
    }

    let name = match identities.resolve(prediction.label) {
        Resolved::Known(name) => name,
        Resolved::Unknown => {
            return Decision {
                name: Resolved::Unknown,
                marker: Marker::Accept,
                outcome: Outcome::UnknownIdentity,
            }
        }
    };

    let outcome = if ledger.contains(&name) {
        Outcome::AlreadyInSession
    } else if today.contains(&name) {
        Outcome::AlreadyMarkedToday
    } else {
        ledger.insert(&name, now);
        Outcome::Marked(AttendanceRecord::new(name.clone(), now))
    };

    Decision {
        name: Resolved::Known(name),
        marker: Marker::Accept,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_timestamp;

    fn identities() -> IdentityMap {
        IdentityMap::from_entries([(0, "Alice"), (1, "Bob")]).unwrap()
    }

    fn today() -> DailyAttendanceIndex {
        DailyAttendanceIndex::empty(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    fn at(ts: &str) -> NaiveDateTime {
        parse_timestamp(ts).unwrap()
    }

    fn predict(label: i32, confidence: f64) -> Prediction {
        Prediction { label, confidence }
    }

    #[test]
    fn test_threshold_boundary() {
        assert!(is_accepted(69.9));
        assert!(!is_accepted(70.0));
        assert!(!is_accepted(70.1));
    }

    #[test]
    fn test_new_name_is_marked_with_decision_time() {
        let mut ledger = SessionLedger::new();
        let now = at("2024-01-01 09:15:00");
        let d = decide(&predict(0, 42.0), &identities(), &mut ledger, &today(), now);

        assert_eq!(d.name, Resolved::Known("Alice".into()));
        assert_eq!(d.marker, Marker::Accept);
        assert_eq!(d.outcome, Outcome::Marked(AttendanceRecord::new("Alice", now)));
        assert_eq!(ledger.records(), &[AttendanceRecord::new("Alice", now)]);
    }

    #[test]
    fn test_rejected_forces_unknown() {
        let mut ledger = SessionLedger::new();
        let d = decide(
            &predict(0, 70.0),
            &identities(),
            &mut ledger,
            &today(),
            at("2024-01-01 09:00:00"),
        );
        assert_eq!(d.name, Resolved::Unknown);
        assert_eq!(d.marker, Marker::Reject);
        assert_eq!(d.outcome, Outcome::Rejected);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_unmapped_label_is_accepted_as_unknown_and_not_recorded() {
        let mut ledger = SessionLedger::new();
        let d = decide(
            &predict(99, 10.0),
            &identities(),
            &mut ledger,
            &today(),
            at("2024-01-01 09:00:00"),
        );
        assert_eq!(d.name, Resolved::Unknown);
        assert_eq!(d.marker, Marker::Accept);
        assert_eq!(d.outcome, Outcome::UnknownIdentity);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_second_sighting_keeps_first_timestamp() {
        let mut ledger = SessionLedger::new();
        let first = at("2024-01-01 09:00:00");
        decide(&predict(1, 30.0), &identities(), &mut ledger, &today(), first);
        let d = decide(
            &predict(1, 20.0),
            &identities(),
            &mut ledger,
            &today(),
            at("2024-01-01 09:05:00"),
        );

        assert_eq!(d.outcome, Outcome::AlreadyInSession);
        assert_eq!(d.marker, Marker::Accept);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.records()[0].timestamp, first);
    }

    #[test]
    fn test_already_marked_today_is_not_added() {
        let mut ledger = SessionLedger::new();
        let index = DailyAttendanceIndex::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            HashSet::from(["Alice".to_string()]),
        );
        let d = decide(
            &predict(0, 12.5),
            &identities(),
            &mut ledger,
            &index,
            at("2024-01-01 10:00:00"),
        );

        assert_eq!(d.outcome, Outcome::AlreadyMarkedToday);
        assert_eq!(d.marker, Marker::Accept);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ledger_preserves_insertion_order() {
        let mut ledger = SessionLedger::new();
        assert!(ledger.insert("Zed", at("2024-01-01 09:00:00")));
        assert!(ledger.insert("Amy", at("2024-01-01 09:01:00")));
        assert!(!ledger.insert("Zed", at("2024-01-01 09:02:00")));
        let names: Vec<&str> = ledger.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Zed", "Amy"]);

        ledger.clear();
        assert!(ledger.is_empty());
        assert!(!ledger.contains("Zed"));
    }
}
