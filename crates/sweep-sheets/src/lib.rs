//! Calculation-surface port backed by a Google Sheets style values API:
//! A1 cell addressing, cell text parsing, and the blocking HTTP client.

pub mod addr;
pub mod client;
pub mod value;

pub use addr::{column_to_number, number_to_column, AddrError, CellRef};
pub use client::{SheetsSurface, DEFAULT_BASE_URL};
pub use value::{parse_numeric, ValueError, ERROR_MARKERS};
