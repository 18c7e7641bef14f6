//! Ports to the three external collaborators: the stateful calculation
//! surface, the result sink, and the parameter store the resume path
//! queries. The driver only ever talks through these traits.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::record::ResultRecord;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("transport failure talking to {endpoint}: {detail}")]
    Transport { endpoint: String, detail: String },
    #[error("malformed response from {endpoint}: {detail}")]
    Malformed { endpoint: String, detail: String },
}

impl PortError {
    pub fn transport(endpoint: impl Into<String>, detail: impl fmt::Display) -> Self {
        PortError::Transport {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }

    pub fn malformed(endpoint: impl Into<String>, detail: impl fmt::Display) -> Self {
        PortError::Malformed {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }
}

/// The shared mutable calculation surface. One instrument maps to one
/// surface; callers must keep at most one combination in flight per
/// instrument.
pub trait Surface {
    /// Writes one input cell. Implementations must not return until the
    /// value is durably visible to subsequent reads.
    fn write_cell(&self, cell: &str, value: f64) -> Result<(), PortError>;

    /// Reads one cell as a number. Non-numeric content (spreadsheet error
    /// markers, placeholder text) is a malformed response.
    fn read_cell(&self, cell: &str) -> Result<f64, PortError>;
}

/// Acknowledgment from the result sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    pub accepted: bool,
    /// Record count reported by the sink after this submit.
    pub running_count: i64,
}

pub trait ResultSink {
    /// Submits one record. A reachable sink that refuses the record or
    /// garbles its answer yields `accepted == false`; `Err` is a
    /// transport-level failure. The driver tolerates both and keeps going.
    fn submit(&self, record: &ResultRecord) -> Result<SubmitAck, PortError>;
}

/// The most recent combination recorded for an instrument, as returned by
/// the parameter store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCombination {
    /// Component position per dimension name.
    pub positions: BTreeMap<String, usize>,
}

pub trait ParamStore {
    /// Returns the last recorded combination, or `None` when the store has
    /// never seen this instrument. Transport and shape failures are `Err`,
    /// kept distinct from `None` so resume never mistakes an outage for a
    /// fresh start.
    fn lookup(&self, instrument: &str) -> Result<Option<StoredCombination>, PortError>;
}
