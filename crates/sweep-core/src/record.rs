use std::collections::BTreeMap;
use std::fmt;

/// Which step of a sweep produced a record: the one-off baseline push or an
/// indexed grid combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStep {
    Baseline,
    Index(u64),
}

impl fmt::Display for SweepStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStep::Baseline => write!(f, "baseline"),
            SweepStep::Index(index) => write!(f, "{}", index),
        }
    }
}

/// One input parameter as read back from the surface after settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedParam {
    pub name: String,
    /// Settled input value, rounded to 2 decimal places.
    pub value: f64,
    /// Component position within the dimension (0 for baseline steps).
    pub position: usize,
}

/// The full record forwarded to the result sink after one settled step.
/// Immutable once assembled; ownership transfers to the sink on submit and
/// nothing is retained locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub instrument: String,
    pub dataset: String,
    pub step: SweepStep,
    pub params: Vec<RecordedParam>,
    /// Derived performance metrics by wire name, rounded to 4 decimal
    /// places. BTreeMap keeps the serialized order stable.
    pub metrics: BTreeMap<String, f64>,
    /// Deterministic submission key so the sink may deduplicate retries.
    pub request_id: String,
}

/// Rounds to `decimals` decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_matches_fixed_point_readback() {
        assert_eq!(round_to(0.8472, 2), 0.85);
        assert_eq!(round_to(4.0, 2), 4.0);
        assert_eq!(round_to(1.0 / 3.0, 4), 0.3333);
        assert_eq!(round_to(-0.10551, 2), -0.11);
        assert_eq!(round_to(0.123449, 4), 0.1234);
    }

    #[test]
    fn step_display_feeds_logs_and_keys() {
        assert_eq!(SweepStep::Baseline.to_string(), "baseline");
        assert_eq!(SweepStep::Index(363).to_string(), "363");
    }
}
