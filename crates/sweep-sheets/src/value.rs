//! Cell text interpretation. The surface hands back display text; formula
//! errors and half-rendered placeholders must never be mistaken for data.

use thiserror::Error;

/// Spreadsheet formula error markers, as rendered by the surface.
pub const ERROR_MARKERS: [&str; 7] = [
    "#N/A", "#DIV/0!", "#ERROR!", "#VALUE!", "#REF!", "#NAME?", "#NUM!",
];

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cell shows formula error '{0}'")]
    Marker(String),
    #[error("cell still shows placeholder text '{0}'")]
    Placeholder(String),
    #[error("cell text '{0}' is not a number")]
    NotNumeric(String),
}

/// Parses cell display text as a number. An empty cell reads as 0, matching
/// the surface API's behavior when the value range comes back empty.
pub fn parse_numeric(text: &str) -> Result<f64, ValueError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    if ERROR_MARKERS.contains(&trimmed) {
        return Err(ValueError::Marker(trimmed.to_string()));
    }
    // Cells under recompute can transiently show "target ..." text.
    if trimmed.contains("target") {
        return Err(ValueError::Placeholder(trimmed.to_string()));
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| ValueError::NotNumeric(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_numbers_parse() {
        assert_eq!(parse_numeric("0.85").unwrap(), 0.85);
        assert_eq!(parse_numeric(" 4 ").unwrap(), 4.0);
        assert_eq!(parse_numeric("-0.1234").unwrap(), -0.1234);
    }

    #[test]
    fn empty_cell_reads_as_zero() {
        assert_eq!(parse_numeric("").unwrap(), 0.0);
        assert_eq!(parse_numeric("   ").unwrap(), 0.0);
    }

    #[test]
    fn every_error_marker_is_rejected() {
        for marker in ERROR_MARKERS {
            assert!(matches!(parse_numeric(marker), Err(ValueError::Marker(_))));
        }
    }

    #[test]
    fn placeholder_text_is_rejected() {
        assert!(matches!(
            parse_numeric("target not ready"),
            Err(ValueError::Placeholder(_))
        ));
    }

    #[test]
    fn garbage_is_not_numeric() {
        assert!(matches!(
            parse_numeric("n/a"),
            Err(ValueError::NotNumeric(_))
        ));
    }
}
