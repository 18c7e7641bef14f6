//! A1-notation cell addressing.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("cell address is empty")]
    Empty,
    #[error("cell address '{0}' has no column letters")]
    MissingColumn(String),
    #[error("cell address '{0}' has no valid row number")]
    MissingRow(String),
    #[error("cell address '{0}' mixes letters and digits out of order")]
    Garbled(String),
}

/// A single cell, columns and rows both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub col: u32,
    pub row: u32,
}

impl CellRef {
    /// Parses `"B6"` style addresses. Letter case is ignored.
    pub fn parse(text: &str) -> Result<Self, AddrError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AddrError::Empty);
        }
        let split = trimmed
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| AddrError::MissingRow(trimmed.to_string()))?;
        let (letters, digits) = trimmed.split_at(split);
        if letters.is_empty() {
            return Err(AddrError::MissingColumn(trimmed.to_string()));
        }
        if !letters.chars().all(|c| c.is_ascii_alphabetic())
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AddrError::Garbled(trimmed.to_string()));
        }
        let col = column_to_number(letters);
        let row: u32 = digits
            .parse()
            .map_err(|_| AddrError::MissingRow(trimmed.to_string()))?;
        if row == 0 {
            return Err(AddrError::MissingRow(trimmed.to_string()));
        }
        Ok(CellRef { col, row })
    }

    /// Same row, shifted right by `offset` columns. Used to relocate a cell
    /// layout when several instruments share one sheet side by side.
    pub fn with_col_offset(&self, offset: u32) -> CellRef {
        CellRef {
            col: self.col + offset,
            row: self.row,
        }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", number_to_column(self.col), self.row)
    }
}

/// Excel-style column letters to a 1-based number: A=1, Z=26, AA=27.
pub fn column_to_number(letters: &str) -> u32 {
    let mut num = 0u32;
    for c in letters.chars() {
        num = num * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    num
}

/// Inverse of [`column_to_number`]. Returns an empty string for 0.
pub fn number_to_column(mut num: u32) -> String {
    let mut out = Vec::new();
    while num > 0 {
        num -= 1;
        out.push(b'A' + (num % 26) as u8);
        num /= 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_round_trip() {
        for (letters, num) in [("A", 1), ("B", 2), ("I", 9), ("M", 13), ("Z", 26), ("AA", 27), ("AE", 31)] {
            assert_eq!(column_to_number(letters), num);
            assert_eq!(number_to_column(num), letters);
        }
    }

    #[test]
    fn parse_and_display_agree() {
        let cell = CellRef::parse("B6").unwrap();
        assert_eq!(cell, CellRef { col: 2, row: 6 });
        assert_eq!(cell.to_string(), "B6");
        assert_eq!(CellRef::parse("aa12").unwrap().to_string(), "AA12");
    }

    #[test]
    fn offset_moves_columns_only() {
        // The multi-instrument layout starts at M and strides 9 columns.
        let base = CellRef::parse("I6").unwrap();
        assert_eq!(base.with_col_offset(4).to_string(), "M6");
        assert_eq!(base.with_col_offset(13).to_string(), "V6");
    }

    #[test]
    fn bad_addresses_are_rejected() {
        assert!(matches!(CellRef::parse(""), Err(AddrError::Empty)));
        assert!(matches!(CellRef::parse("B"), Err(AddrError::MissingRow(_))));
        assert!(matches!(CellRef::parse("6"), Err(AddrError::MissingColumn(_))));
        assert!(matches!(CellRef::parse("B0"), Err(AddrError::MissingRow(_))));
        assert!(matches!(CellRef::parse("B6C"), Err(AddrError::Garbled(_))));
    }
}
