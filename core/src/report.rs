//! The statistics container and its merge algebra.
//!
//! A [`Report`] is a commutative monoid: keys are unioned across operands,
//! per-key values are summed (or concatenated, for the detailed success
//! variant). The empty report is the identity element. Subtraction and
//! scalar multiplication exist for diagnostics and snapshot deltas, not as
//! monoid operations.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::ops::{Add, AddAssign, Mul, Sub};

use serde::{Deserialize, Serialize};

/// One entry of the `success` section: either a running `(count, time)`
/// tally (the default, low-overhead form) or the full list of per-call
/// durations (kept when the report was built with [`Report::detailed`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SuccessEntry {
    Compact { count: u64, time: f64 },
    Detailed(Vec<f64>),
}

impl SuccessEntry {
    fn compact(duration: f64) -> Self {
        SuccessEntry::Compact { count: 1, time: duration }
    }

    fn detailed(duration: f64) -> Self {
        SuccessEntry::Detailed(vec![duration])
    }

    /// `time / count`, derived on demand rather than stored.
    pub fn average_duration(&self) -> f64 {
        match self {
            SuccessEntry::Compact { count, time } if *count > 0 => time / *count as f64,
            SuccessEntry::Compact { .. } => 0.0,
            SuccessEntry::Detailed(durations) if !durations.is_empty() => {
                durations.iter().sum::<f64>() / durations.len() as f64
            }
            SuccessEntry::Detailed(_) => 0.0,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            SuccessEntry::Compact { count, .. } => *count,
            SuccessEntry::Detailed(durations) => durations.len() as u64,
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (
                SuccessEntry::Compact { count: c1, time: t1 },
                SuccessEntry::Compact { count: c2, time: t2 },
            ) => SuccessEntry::Compact { count: c1 + c2, time: t1 + t2 },
            (SuccessEntry::Detailed(mut a), SuccessEntry::Detailed(b)) => {
                a.extend(b);
                SuccessEntry::Detailed(a)
            }
            // Mixed variants only happen if a report was built inconsistently
            // (some calls detailed, some not) for the same name. Fold the
            // compact side into detailed form using its average so the merge
            // stays associative for the cases this corpus actually produces.
            (SuccessEntry::Compact { count, time }, SuccessEntry::Detailed(mut durations))
            | (SuccessEntry::Detailed(mut durations), SuccessEntry::Compact { count, time }) => {
                if count > 0 {
                    let avg = time / count as f64;
                    durations.extend(std::iter::repeat(avg).take(count as usize));
                }
                SuccessEntry::Detailed(durations)
            }
        }
    }

    fn scale(self, k: u64) -> Self {
        match self {
            SuccessEntry::Compact { count, time } => SuccessEntry::Compact {
                count: count * k,
                time: time * k as f64,
            },
            SuccessEntry::Detailed(durations) => {
                SuccessEntry::Detailed(durations.into_iter().map(|d| d * k as f64).collect())
            }
        }
    }
}

/// Kinds an HTTP outcome can be classified into. `Success` is intentionally
/// excluded — it is never routed through [`Report::add_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Request,
    Monitored,
    Other,
}

impl ErrorKind {
    fn section_name(self) -> &'static str {
        match self {
            ErrorKind::Request => "request errors",
            ErrorKind::Monitored => "monitored errors",
            ErrorKind::Other => "other errors",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub success: HashMap<String, SuccessEntry>,
    #[serde(default, rename = "request errors")]
    pub request_errors: HashMap<String, i64>,
    #[serde(default, rename = "monitored errors")]
    pub monitored_errors: HashMap<String, i64>,
    #[serde(default, rename = "other errors")]
    pub other_errors: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub statistics: HashMap<String, i64>,

    /// Not part of the wire shape: whether [`Self::add_success`] should
    /// retain individual durations. Defaults to the compact form.
    #[serde(skip)]
    detailed: bool,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// A report that records every per-call duration instead of a running
    /// `(count, time)` tally.
    pub fn detailed() -> Self {
        Report { detailed: true, ..Default::default() }
    }

    pub fn is_detailed(&self) -> bool {
        self.detailed
    }

    pub fn add_success(&mut self, name: impl Into<String>, duration: f64) {
        let name = name.into();
        let detailed = self.detailed;
        self.success
            .entry(name)
            .and_modify(|entry| {
                let merged = std::mem::replace(entry, SuccessEntry::Compact { count: 0, time: 0.0 })
                    .merge(if detailed { SuccessEntry::detailed(duration) } else { SuccessEntry::compact(duration) });
                *entry = merged;
            })
            .or_insert_with(|| if detailed { SuccessEntry::detailed(duration) } else { SuccessEntry::compact(duration) });
    }

    /// Route a caller-declared error kind into its section. Unknown kinds
    /// (including `"success"`) are a silent no-op, matching the spec's
    /// error-kind routing invariant.
    pub fn add_error(&mut self, name: impl Into<String>, kind: &str) {
        let name = name.into();
        match kind {
            "request errors" => *self.request_errors.entry(name).or_insert(0) += 1,
            "monitored errors" => *self.monitored_errors.entry(name).or_insert(0) += 1,
            "other errors" => *self.other_errors.entry(name).or_insert(0) += 1,
            _ => {}
        }
    }

    pub fn add_error_kind(&mut self, name: impl Into<String>, kind: ErrorKind) {
        self.add_error(name, kind.section_name());
    }

    pub fn add_statistics(&mut self, name: impl Into<String>, value: i64) {
        *self.statistics.entry(name.into()).or_insert(0) += value;
    }

    /// Replace `self` with the empty report, returning the previous contents.
    /// Used by stats reporters that upload a snapshot and reset on read.
    pub fn take(&mut self) -> Report {
        std::mem::replace(self, if self.detailed { Report::detailed() } else { Report::new() })
    }

    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Report serializes to a JSON object")
    }

    pub fn from_dict(value: &serde_json::Value) -> Report {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:<32} {:>10} {:>12}", "name", "count", "avg ms");
        let mut names: Vec<_> = self.success.keys().collect();
        names.sort();
        for name in names {
            let entry = &self.success[name];
            let _ = writeln!(
                out,
                "{:<32} {:>10} {:>12.2}",
                name,
                entry.count(),
                entry.average_duration() * 1000.0
            );
        }
        for (label, section) in [
            ("request errors", &self.request_errors),
            ("monitored errors", &self.monitored_errors),
            ("other errors", &self.other_errors),
        ] {
            if section.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{label}:");
            let mut names: Vec<_> = section.keys().collect();
            names.sort();
            for name in names {
                let _ = writeln!(out, "  {:<30} {:>10}", name, section[name]);
            }
        }
        out
    }
}

fn merge_error_maps(mut a: HashMap<String, i64>, b: HashMap<String, i64>) -> HashMap<String, i64> {
    for (k, v) in b {
        *a.entry(k).or_insert(0) += v;
    }
    a
}

fn sub_error_maps(mut a: HashMap<String, i64>, b: HashMap<String, i64>) -> HashMap<String, i64> {
    for (k, v) in b {
        *a.entry(k).or_insert(0) -= v;
    }
    a
}

impl Add for Report {
    type Output = Report;

    fn add(mut self, rhs: Report) -> Report {
        self.detailed = self.detailed || rhs.detailed;
        for (name, entry) in rhs.success {
            self.success
                .entry(name)
                .and_modify(|e| {
                    let merged = std::mem::replace(e, SuccessEntry::Compact { count: 0, time: 0.0 })
                        .merge(entry.clone());
                    *e = merged;
                })
                .or_insert(entry);
        }
        self.request_errors = merge_error_maps(self.request_errors, rhs.request_errors);
        self.monitored_errors = merge_error_maps(self.monitored_errors, rhs.monitored_errors);
        self.other_errors = merge_error_maps(self.other_errors, rhs.other_errors);
        self.statistics = merge_error_maps(self.statistics, rhs.statistics);
        self
    }
}

impl AddAssign for Report {
    fn add_assign(&mut self, rhs: Report) {
        *self = std::mem::take(self) + rhs;
    }
}

impl Sub for Report {
    type Output = Report;

    fn sub(mut self, rhs: Report) -> Report {
        for (name, entry) in rhs.success {
            self.success
                .entry(name)
                .and_modify(|e| {
                    *e = match (&e, &entry) {
                        (
                            SuccessEntry::Compact { count: c1, time: t1 },
                            SuccessEntry::Compact { count: c2, time: t2 },
                        ) => SuccessEntry::Compact {
                            count: c1.saturating_sub(*c2),
                            time: t1 - t2,
                        },
                        (SuccessEntry::Detailed(a), SuccessEntry::Detailed(b)) => {
                            let keep = a.len().saturating_sub(b.len());
                            SuccessEntry::Detailed(a[..keep].to_vec())
                        }
                        _ => e.clone(),
                    };
                })
                .or_insert(entry);
        }
        self.request_errors = sub_error_maps(self.request_errors, rhs.request_errors);
        self.monitored_errors = sub_error_maps(self.monitored_errors, rhs.monitored_errors);
        self.other_errors = sub_error_maps(self.other_errors, rhs.other_errors);
        self.statistics = sub_error_maps(self.statistics, rhs.statistics);
        self
    }
}

impl Mul<u64> for Report {
    type Output = Report;

    fn mul(mut self, k: u64) -> Report {
        self.success = self
            .success
            .into_iter()
            .map(|(name, entry)| (name, entry.scale(k)))
            .collect();
        for section in [&mut self.request_errors, &mut self.monitored_errors, &mut self.other_errors, &mut self.statistics] {
            for v in section.values_mut() {
                *v *= k as i64;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_commutative_and_associative() {
        let mut a = Report::new();
        a.add_success("login", 0.1);
        a.add_error("login", "request errors");

        let mut b = Report::new();
        b.add_success("login", 0.2);
        b.add_error("logout", "other errors");

        let mut c = Report::new();
        c.add_success("logout", 0.3);

        let ab_c = (a.clone() + b.clone()) + c.clone();
        let a_bc = a.clone() + (b.clone() + c.clone());
        assert_eq!(ab_c, a_bc);

        let a_plus_b = a.clone() + b.clone();
        let b_plus_a = b + a;
        assert_eq!(a_plus_b, b_plus_a);
    }

    #[test]
    fn empty_report_is_identity() {
        let mut a = Report::new();
        a.add_success("login", 0.1);
        let merged = a.clone() + Report::new();
        assert_eq!(merged, a);
    }

    #[test]
    fn subtract_zeros_self() {
        let mut a = Report::new();
        a.add_success("login", 0.1);
        a.add_error("login", "request errors");
        let zeroed = a.clone() - a;
        match &zeroed.success["login"] {
            SuccessEntry::Compact { count, time } => {
                assert_eq!(*count, 0);
                assert_eq!(*time, 0.0);
            }
            _ => panic!("expected compact entry"),
        }
        assert_eq!(zeroed.request_errors["login"], 0);
    }

    #[test]
    fn scalar_multiply_distributes_over_merge() {
        let mut a = Report::new();
        a.add_success("login", 0.1);
        let mut b = Report::new();
        b.add_success("login", 0.2);

        let lhs = (a.clone() + b.clone()) * 3;
        let rhs = (a * 3) + (b * 3);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn round_trip_preserves_structure() {
        let mut a = Report::new();
        a.add_success("login", 0.1);
        a.add_error("login", "request errors");
        a.add_error("login", "monitored errors");
        a.add_error("login", "other errors");
        a.add_statistics("custom_counter", 3);

        let dict = a.to_dict();
        let back = Report::from_dict(&dict);
        assert_eq!(back.success, a.success);
        assert_eq!(back.request_errors, a.request_errors);
        assert_eq!(back.monitored_errors, a.monitored_errors);
        assert_eq!(back.other_errors, a.other_errors);
    }

    #[test]
    fn deserialize_tolerates_missing_and_unknown_sections() {
        let value = serde_json::json!({
            "success": {"login": {"count": 2, "time": 0.4}},
            "some_future_section": {"whatever": 1},
        });
        let report = Report::from_dict(&value);
        assert_eq!(report.success["login"].count(), 2);
        assert!(report.request_errors.is_empty());
    }

    #[test]
    fn unknown_error_kind_is_a_no_op() {
        let mut a = Report::new();
        a.add_error("login", "success");
        a.add_error("login", "totally made up");
        assert!(a.request_errors.is_empty());
        assert!(a.monitored_errors.is_empty());
        assert!(a.other_errors.is_empty());
    }

    #[test]
    fn detailed_variant_concatenates_durations() {
        let mut a = Report::detailed();
        a.add_success("login", 0.1);
        a.add_success("login", 0.2);
        match &a.success["login"] {
            SuccessEntry::Detailed(d) => assert_eq!(d, &vec![0.1, 0.2]),
            _ => panic!("expected detailed entry"),
        }
    }
}
