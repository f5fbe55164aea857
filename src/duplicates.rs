// Duplicate fact classification
use crate::facts::FactIndex;
use crate::model::FactInstance;
use crate::{Error, Result};
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flat tolerance against the larger magnitude (0.01 %).
pub const DEFAULT_PERCENTAGE_TOLERANCE: f64 = 0.0001;
/// Relative spread up to which a conflict reads as rounding (0.1 %).
pub const DEFAULT_ROUNDING_THRESHOLD: f64 = 0.001;
/// Relative spread above which a conflict reads as a restatement (5 %).
pub const DEFAULT_RESTATEMENT_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Decimal,
    Percentage,
    #[default]
    Both,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "decimal" => Ok(Strategy::Decimal),
            "percentage" => Ok(Strategy::Percentage),
            "both" => Ok(Strategy::Both),
            other => Err(Error::Config(format!(
                "Unknown comparison strategy '{}': expected decimal, percentage or both",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub strategy: Strategy,
    pub percentage_tolerance: f64,
    pub rounding_threshold: f64,
    pub restatement_threshold: f64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Both,
            percentage_tolerance: DEFAULT_PERCENTAGE_TOLERANCE,
            rounding_threshold: DEFAULT_ROUNDING_THRESHOLD,
            restatement_threshold: DEFAULT_RESTATEMENT_THRESHOLD,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_percentage_tolerance(mut self, tolerance: f64) -> Self {
        self.percentage_tolerance = tolerance;
        self
    }

    pub fn with_thresholds(mut self, rounding: f64, restatement: f64) -> Self {
        self.rounding_threshold = rounding;
        self.restatement_threshold = restatement;
        self
    }

    /// Exact comparisons only.
    pub fn strict() -> Self {
        Self::default()
            .with_strategy(Strategy::Percentage)
            .with_percentage_tolerance(0.0)
    }

    pub fn check(&self) -> Result<()> {
        let valid = |v: f64| v.is_finite() && v >= 0.0;
        if !valid(self.percentage_tolerance) {
            return Err(Error::Config(format!(
                "percentage_tolerance must be a non-negative number, got {}",
                self.percentage_tolerance
            )));
        }
        if !valid(self.rounding_threshold) || !valid(self.restatement_threshold) {
            return Err(Error::Config("cause thresholds must be non-negative numbers".to_string()));
        }
        if self.rounding_threshold > self.restatement_threshold {
            return Err(Error::Config(format!(
                "rounding_threshold ({}) exceeds restatement_threshold ({})",
                self.rounding_threshold, self.restatement_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateType {
    /// Same value, same precision.
    Complete,
    /// Same value at different precisions.
    Consistent,
    /// Conflicting values; not usable.
    Inconsistent,
}

impl DuplicateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateType::Complete => "COMPLETE",
            DuplicateType::Consistent => "CONSISTENT",
            DuplicateType::Inconsistent => "INCONSISTENT",
        }
    }
}

impl fmt::Display for DuplicateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateCause {
    /// The same fact displayed more than once (iXBRL).
    IxbrlDisplay,
    PrecisionVariant,
    RoundingDifference,
    Restatement,
    ValueConflict,
    Unknown,
}

impl DuplicateCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateCause::IxbrlDisplay => "IXBRL_DISPLAY",
            DuplicateCause::PrecisionVariant => "PRECISION_VARIANT",
            DuplicateCause::RoundingDifference => "ROUNDING_DIFFERENCE",
            DuplicateCause::Restatement => "RESTATEMENT",
            DuplicateCause::ValueConflict => "VALUE_CONFLICT",
            DuplicateCause::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DuplicateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub value: Option<String>,
    pub numeric: Option<f64>,
    pub decimals: Option<i32>,
    pub unit: Option<String>,
}

/// Informational only; never feeds back into the classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub entry_count: usize,
    pub unique_values: usize,
    pub unique_precisions: usize,
    pub entries: Vec<EntrySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_difference: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateInfo {
    pub concept: String,
    pub context_id: String,
    pub entries: Vec<FactInstance>,
    /// `None` for zero or one entry.
    pub duplicate_type: Option<DuplicateType>,
    pub cause: Option<DuplicateCause>,
    pub selected_index: Option<usize>,
    pub value_range: Option<(f64, f64)>,
    pub precision_range: Option<(i32, i32)>,
    pub diagnostics: Diagnostics,
}

impl DuplicateInfo {
    pub fn has_duplicates(&self) -> bool {
        self.entries.len() > 1
    }

    /// Whether a value may be used downstream.
    pub fn is_usable(&self) -> bool {
        self.duplicate_type != Some(DuplicateType::Inconsistent) && self.selected_index.is_some()
    }

    pub fn is_dimensional(&self) -> bool {
        self.entries.iter().any(FactInstance::is_dimensional)
    }

    pub fn selected(&self) -> Option<&FactInstance> {
        self.selected_index.and_then(|i| self.entries.get(i))
    }

    pub fn selected_value(&self) -> Option<f64> {
        self.selected().and_then(FactInstance::numeric_value)
    }

    pub fn selected_decimals(&self) -> Option<i32> {
        self.selected().and_then(|f| f.decimals)
    }

    pub fn summary(&self) -> String {
        let verdict = match (self.duplicate_type, self.cause) {
            (Some(kind), Some(cause)) => format!("{} ({})", kind, cause),
            (Some(kind), None) => kind.to_string(),
            (None, _) => "single entry".to_string(),
        };
        let selected = match (self.selected_value(), self.selected_decimals()) {
            (Some(v), Some(d)) => format!(", selected {} @ {}", v, d),
            (Some(v), None) => format!(", selected {}", v),
            _ => String::new(),
        };
        format!(
            "{} [{}]: {} entries, {}{}",
            self.concept,
            self.context_id,
            self.entries.len(),
            verdict,
            selected
        )
    }
}

/// Totals over a batch of analyses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateSummary {
    pub groups: usize,
    pub complete: usize,
    pub consistent: usize,
    pub inconsistent: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateHandler {
    config: ReconcilerConfig,
}

impl DuplicateHandler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Classifies the facts reported for one concept in one context.
    pub fn analyze(&self, entries: &[FactInstance], context_id: &str) -> DuplicateInfo {
        let numerics: Vec<Option<f64>> = entries.iter().map(FactInstance::numeric_value).collect();
        let known: Vec<f64> = numerics.iter().flatten().copied().collect();

        let value_range = known.iter().copied().fold(None, |acc: Option<(f64, f64)>, v| {
            Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
        });
        let precision_range = entries.iter().filter_map(|e| e.decimals).fold(None, |acc: Option<(i32, i32)>, d| {
            Some(acc.map_or((d, d), |(lo, hi)| (lo.min(d), hi.max(d))))
        });

        let mut info = DuplicateInfo {
            concept: entries.first().map(|e| e.concept.clone()).unwrap_or_default(),
            context_id: context_id.to_string(),
            entries: entries.to_vec(),
            duplicate_type: None,
            cause: None,
            selected_index: (!entries.is_empty()).then_some(0),
            value_range,
            precision_range,
            diagnostics: self.diagnostics(entries, &numerics),
        };

        if entries.len() <= 1 {
            return info;
        }

        let all_equal = (0..entries.len()).all(|i| {
            (i + 1..entries.len()).all(|j| self.values_equal(&entries[i], numerics[i], &entries[j], numerics[j]))
        });

        if all_equal {
            let (kind, cause) = if info.diagnostics.unique_precisions <= 1 {
                (DuplicateType::Complete, DuplicateCause::IxbrlDisplay)
            } else {
                (DuplicateType::Consistent, DuplicateCause::PrecisionVariant)
            };
            info.duplicate_type = Some(kind);
            info.cause = Some(cause);
            info.selected_index = Some(most_precise(entries));
        } else {
            info.duplicate_type = Some(DuplicateType::Inconsistent);
            info.selected_index = None;
            // A spread over the numeric subset says nothing about a text conflict
            let spread = if numerics.iter().any(Option::is_none) {
                None
            } else {
                value_range.and_then(|(lo, hi)| {
                    let magnitude = lo.abs().max(hi.abs());
                    (magnitude > 0.0).then(|| (hi - lo, (hi - lo) / magnitude))
                })
            };
            info.cause = Some(self.infer_cause(spread.map(|(_, pct)| pct)));
            if let Some((difference, pct)) = spread {
                info.diagnostics.value_difference = Some(difference);
                info.diagnostics.difference_pct = Some(pct);
            }
            log::debug!(
                "Inconsistent duplicates for {} in {}: {:?}",
                info.concept,
                context_id,
                info.cause
            );
        }

        info
    }

    /// Analyzes every (concept, context) group with more than one fact.
    pub fn group_and_analyze(&self, index: &FactIndex) -> Vec<DuplicateInfo> {
        index
            .groups()
            .into_iter()
            .filter(|(_, facts)| facts.len() > 1)
            .map(|((_, context), facts)| {
                let owned: Vec<FactInstance> = facts.into_iter().cloned().collect();
                self.analyze(&owned, context)
            })
            .collect()
    }

    pub fn summarize(infos: &[DuplicateInfo]) -> DuplicateSummary {
        let mut summary = DuplicateSummary {
            groups: infos.len(),
            ..Default::default()
        };
        for info in infos {
            match info.duplicate_type {
                Some(DuplicateType::Complete) => summary.complete += 1,
                Some(DuplicateType::Consistent) => summary.consistent += 1,
                Some(DuplicateType::Inconsistent) => summary.inconsistent += 1,
                None => {}
            }
        }
        summary
    }

    fn values_equal(&self, a: &FactInstance, va: Option<f64>, b: &FactInstance, vb: Option<f64>) -> bool {
        let (Some(x), Some(y)) = (va, vb) else {
            // Text facts compare by their content
            let text = |f: &FactInstance| f.value.as_deref().map(str::trim).unwrap_or("").to_string();
            return text(a) == text(b);
        };

        match self.config.strategy {
            Strategy::Decimal => decimal_equal(x, a.decimals, y, b.decimals),
            Strategy::Percentage => percentage_equal(x, y, self.config.percentage_tolerance),
            Strategy::Both => {
                decimal_equal(x, a.decimals, y, b.decimals)
                    || percentage_equal(x, y, self.config.percentage_tolerance)
            }
        }
    }

    fn infer_cause(&self, relative_spread: Option<f64>) -> DuplicateCause {
        match relative_spread {
            None => DuplicateCause::Unknown,
            Some(pct) if pct <= self.config.rounding_threshold => DuplicateCause::RoundingDifference,
            Some(pct) if pct > self.config.restatement_threshold => DuplicateCause::Restatement,
            Some(_) => DuplicateCause::ValueConflict,
        }
    }

    fn diagnostics(&self, entries: &[FactInstance], numerics: &[Option<f64>]) -> Diagnostics {
        let unique_values: AHashSet<String> = entries
            .iter()
            .zip(numerics)
            .map(|(e, n)| match n {
                Some(v) => v.to_string(),
                None => e.value.clone().unwrap_or_default(),
            })
            .collect();
        // Unknown precision never counts as a variant of its own
        let unique_precisions: AHashSet<i32> = entries.iter().filter_map(|e| e.decimals).collect();

        Diagnostics {
            entry_count: entries.len(),
            unique_values: unique_values.len(),
            unique_precisions: unique_precisions.len(),
            entries: entries
                .iter()
                .zip(numerics)
                .map(|(e, n)| EntrySnapshot {
                    value: e.value.clone(),
                    numeric: *n,
                    decimals: e.decimals,
                    unit: e.unit.clone(),
                })
                .collect(),
            value_difference: None,
            difference_pct: None,
        }
    }
}

/// Index of the entry with the greatest known precision; unknown precision
/// never wins over a known one.
fn most_precise(entries: &[FactInstance]) -> usize {
    let mut best_idx = 0;
    let mut best = entries.first().and_then(|e| e.decimals);
    for (idx, entry) in entries.iter().enumerate().skip(1) {
        if let Some(d) = entry.decimals {
            if best.map_or(true, |b| d > b) {
                best = Some(d);
                best_idx = idx;
            }
        }
    }
    best_idx
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Equal once both are rounded to the coarser of the two precisions.
/// Without any known precision only exact equality counts.
pub fn decimal_equal(x: f64, dx: Option<i32>, y: f64, dy: Option<i32>) -> bool {
    let coarser = match (dx, dy) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return x == y,
    };
    let (rx, ry) = (round_to(x, coarser), round_to(y, coarser));
    (rx - ry).abs() <= f64::EPSILON * rx.abs().max(ry.abs()).max(1.0)
}

/// Equal when the spread relative to the larger magnitude is within
/// `tolerance`. Two zeros are equal; zero against non-zero never is.
pub fn percentage_equal(x: f64, y: f64, tolerance: f64) -> bool {
    let magnitude = x.abs().max(y.abs());
    if magnitude == 0.0 {
        return true;
    }
    (x - y).abs() / magnitude <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fact(value: &str, decimals: Option<i32>) -> FactInstance {
        let mut fact = FactInstance::new("us-gaap:Revenues", "FY2023", value);
        fact.decimals = decimals;
        fact
    }

    #[test]
    fn test_precision_variants_are_consistent() {
        let handler = DuplicateHandler::default();
        let info = handler.analyze(&[fact("1000000", Some(-3)), fact("1000000", Some(-6))], "FY2023");
        assert_eq!(info.duplicate_type, Some(DuplicateType::Consistent));
        assert_eq!(info.cause, Some(DuplicateCause::PrecisionVariant));
        assert_eq!(info.selected_decimals(), Some(-3));
        assert_eq!(info.selected_value(), Some(1_000_000.0));
        assert_eq!(info.precision_range, Some((-6, -3)));
        assert!(info.is_usable());
    }

    #[test]
    fn test_ten_percent_spread_is_restatement() {
        let handler = DuplicateHandler::default();
        let info = handler.analyze(&[fact("5000000", Some(-3)), fact("4500000", Some(-3))], "FY2023");
        assert_eq!(info.duplicate_type, Some(DuplicateType::Inconsistent));
        assert_eq!(info.cause, Some(DuplicateCause::Restatement));
        assert_eq!(info.selected(), None);
        assert!(!info.is_usable());
        assert_eq!(info.diagnostics.value_difference, Some(500_000.0));
        assert_eq!(info.diagnostics.difference_pct, Some(0.1));
        assert_eq!(info.value_range, Some((4_500_000.0, 5_000_000.0)));
    }

    #[test]
    fn test_identical_entries_are_complete() {
        let handler = DuplicateHandler::default();
        let info = handler.analyze(&[fact("1,234", Some(0)), fact("1234", Some(0))], "FY2023");
        assert_eq!(info.duplicate_type, Some(DuplicateType::Complete));
        assert_eq!(info.cause, Some(DuplicateCause::IxbrlDisplay));
        assert_eq!(info.selected_index, Some(0));
        assert_eq!(info.diagnostics.unique_values, 1);
    }

    #[test]
    fn test_trivial_sets() {
        let handler = DuplicateHandler::default();
        let empty = handler.analyze(&[], "c1");
        assert_eq!(empty.duplicate_type, None);
        assert_eq!(empty.selected(), None);

        let single = handler.analyze(&[fact("42", None)], "c1");
        assert_eq!(single.duplicate_type, None);
        assert!(!single.has_duplicates());
        assert!(single.is_usable());
        assert_eq!(single.selected_value(), Some(42.0));
    }

    #[test]
    fn test_cause_thresholds() {
        let handler = DuplicateHandler::new(ReconcilerConfig::strict());
        let cause = |a: &str, b: &str| handler.analyze(&[fact(a, Some(0)), fact(b, Some(0))], "c").cause;
        assert_eq!(cause("100000", "100050"), Some(DuplicateCause::RoundingDifference));
        assert_eq!(cause("100", "103"), Some(DuplicateCause::ValueConflict));
        assert_eq!(cause("100", "150"), Some(DuplicateCause::Restatement));
        assert_eq!(cause("0", "0.000"), Some(DuplicateCause::IxbrlDisplay), "equal zeros are complete");
        assert_eq!(cause("abc", "xyz"), Some(DuplicateCause::Unknown));

        let custom = DuplicateHandler::new(ReconcilerConfig::strict().with_thresholds(0.001, 0.2));
        let info = custom.analyze(&[fact("100", Some(0)), fact("110", Some(0))], "c");
        assert_eq!(info.cause, Some(DuplicateCause::ValueConflict));
    }

    #[test]
    fn test_unknown_precision_never_preferred() {
        let handler = DuplicateHandler::new(ReconcilerConfig::default().with_strategy(Strategy::Percentage));
        let info = handler.analyze(&[fact("500", None), fact("500", Some(-2)), fact("500", None)], "c");
        assert_eq!(info.duplicate_type, Some(DuplicateType::Complete));
        assert_eq!(info.selected_index, Some(1));
    }

    #[test]
    fn test_missing_precision_is_not_a_variant() {
        let handler = DuplicateHandler::default();
        let info = handler.analyze(&[fact("1000", None), fact("1000", Some(-3))], "FY2023");
        assert_eq!(info.diagnostics.unique_precisions, 1);
        assert_eq!(info.duplicate_type, Some(DuplicateType::Complete));
        assert_eq!(info.cause, Some(DuplicateCause::IxbrlDisplay));
        assert_eq!(info.selected_decimals(), Some(-3));
    }

    #[test]
    fn test_number_against_text_has_unknown_cause() {
        let handler = DuplicateHandler::default();
        let info = handler.analyze(&[fact("1000", Some(0)), fact("abc", None)], "FY2023");
        assert_eq!(info.duplicate_type, Some(DuplicateType::Inconsistent));
        assert_eq!(info.cause, Some(DuplicateCause::Unknown));
        assert_eq!(info.diagnostics.value_difference, None);
        assert_eq!(info.diagnostics.difference_pct, None);
        assert_eq!(info.value_range, Some((1000.0, 1000.0)));
    }

    #[test]
    fn test_strategies() {
        assert!(decimal_equal(1_234_567.0, Some(0), 1_235_000.0, Some(-3)));
        assert!(!decimal_equal(1_234_567.0, Some(0), 1_235_000.0, Some(0)));
        assert!(!decimal_equal(1.0, None, 1.0000001, None));
        assert!(percentage_equal(1_000_000.0, 1_000_050.0, DEFAULT_PERCENTAGE_TOLERANCE));
        assert!(!percentage_equal(0.0, 1.0, DEFAULT_PERCENTAGE_TOLERANCE));
        assert!(percentage_equal(0.0, 0.0, 0.0));

        let pair = [fact("1000000", Some(0)), fact("1000050", Some(0))];
        let decimal = DuplicateHandler::new(ReconcilerConfig::default().with_strategy(Strategy::Decimal));
        assert_eq!(decimal.analyze(&pair, "c").duplicate_type, Some(DuplicateType::Inconsistent));
        let both = DuplicateHandler::default();
        assert_eq!(both.analyze(&pair, "c").duplicate_type, Some(DuplicateType::Complete));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Decimal".parse::<Strategy>().unwrap(), Strategy::Decimal);
        assert_eq!(" BOTH ".parse::<Strategy>().unwrap(), Strategy::Both);
        assert!(matches!("fuzzy".parse::<Strategy>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_check() {
        assert!(ReconcilerConfig::default().check().is_ok());
        assert!(ReconcilerConfig::default().with_percentage_tolerance(-1.0).check().is_err());
        assert!(ReconcilerConfig::default().with_thresholds(0.1, 0.01).check().is_err());
    }

    #[test]
    fn test_group_and_analyze() {
        let mut index = FactIndex::new();
        index.add_fact(fact("1000000", Some(-3)));
        index.add_fact(fact("1000000", Some(-6)));
        index.add_fact(FactInstance::new("us-gaap:Assets", "FY2023", "10"));
        let mut other = fact("7", None);
        other.context_ref = "Q4".to_string();
        index.add_fact(other);

        let handler = DuplicateHandler::default();
        let infos = handler.group_and_analyze(&index);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].concept, "us-gaap:Revenues");
        assert_eq!(infos[0].context_id, "FY2023");
        assert_eq!(
            infos[0].summary(),
            "us-gaap:Revenues [FY2023]: 2 entries, CONSISTENT (PRECISION_VARIANT), selected 1000000 @ -3"
        );

        let summary = DuplicateHandler::summarize(&infos);
        assert_eq!(summary.groups, 1);
        assert_eq!(summary.consistent, 1);
    }
}
