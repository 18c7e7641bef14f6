//! Domain types for a sheet-hosted backtest parameter sweep: the parameter
//! grid with its mixed-radix index codec, the result record produced per
//! combination, and the ports the sweep driver talks through.

pub mod grid;
pub mod port;
pub mod record;

pub use grid::{Combination, Dimension, Grid, GridError};
pub use port::{ParamStore, PortError, ResultSink, StoredCombination, SubmitAck, Surface};
pub use record::{round_to, RecordedParam, ResultRecord, SweepStep};
