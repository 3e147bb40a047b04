//! Mutation validation.
//!
//! Every cell write is checked before it reaches a compute instance:
//!
//! 1. The cell must lie inside the caller's allowed area (`"B2:D10"`).
//! 2. Values must be primitives (string, number, boolean or null).
//! 3. Formulas (strings starting with `=`) must not reference external
//!    workbooks and must not call functions that fetch remote content or
//!    resolve references indirectly.
//!
//! Validation is all-or-nothing: the first violation rejects the whole
//! update, and only a [`SanitizedUpdate`] can be applied to an instance.
//!
//! Addresses use A1 notation externally and zero-based `(row, col)`
//! coordinates internally, so `A1` is `(0, 0)` and `B2` is `(1, 1)`.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Largest text value accepted for a single cell.
pub const MAX_TEXT_LEN: usize = 32_767;

/// Largest formula accepted for a single cell.
pub const MAX_FORMULA_LEN: usize = 8_192;

const MAX_ROWS: u32 = 1_048_576;
const MAX_COLS: u32 = 16_384;

/// Functions rejected inside formulas.
pub const DENIED_FUNCTIONS: &[&str] = &[
    "CALL",
    "DDE",
    "EVALUATE",
    "FILTERXML",
    "HYPERLINK",
    "IMAGE",
    "IMPORTDATA",
    "IMPORTFEED",
    "IMPORTHTML",
    "IMPORTRANGE",
    "IMPORTXML",
    "INDIRECT",
    "REGISTER.ID",
    "RTD",
    "SQL.REQUEST",
    "WEBSERVICE",
];

#[allow(clippy::expect_used)]
static CELL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$?([A-Za-z]{1,3})\$?([1-9][0-9]*)$").expect("static pattern")
});

#[allow(clippy::expect_used)]
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(?:[^"]|"")*""#).expect("static pattern"));

// `[Book.xlsx]Sheet1!A1`, `'C:\dir\[Book.xlsx]Sheet 1'!A1`, `[1]Sheet1!A1`
#[allow(clippy::expect_used)]
static EXTERNAL_SHEET_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[[^\]]+\][^!(),+\-*/&=<>^;"]*!"#).expect("static pattern"));

// `[Book.xlsx]` on its own, e.g. an external defined name.
#[allow(clippy::expect_used)]
static EXTERNAL_WORKBOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[[^\]]*\.(?:xl[a-z]{0,2}|csv|ods)\]").expect("static pattern")
});

#[allow(clippy::expect_used)]
static DENIED_CALL: LazyLock<Regex> = LazyLock::new(|| {
    let names = DENIED_FUNCTIONS.iter().map(|name| regex::escape(name)).collect::<Vec<_>>();
    Regex::new(&format!(r"(?i)(?:^|[^A-Za-z0-9_.])(?:_xlfn\.)?({})\s*\(", names.join("|")))
        .expect("denylist pattern")
});

/// Reasons a mutation is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// The cell lies outside the allowed area.
    #[error("cell {cell} is outside the allowed area {area}")]
    OutOfArea {
        /// Offending cell in A1 notation.
        cell: String,
        /// Allowed area as given.
        area: String,
    },

    /// A formula references another workbook.
    #[error("cell {cell} references an external workbook")]
    ExternalReference {
        /// Offending cell in A1 notation.
        cell: String,
    },

    /// A formula calls a denied function.
    #[error("cell {cell} calls denied function {function}")]
    DeniedFunction {
        /// Offending cell in A1 notation.
        cell: String,
        /// Upper-cased function name.
        function: String,
    },

    /// The value is an object or array.
    #[error("cell {cell} holds a nested value; only primitives are allowed")]
    NestedValue {
        /// Offending cell in A1 notation.
        cell: String,
    },

    /// The value is longer than allowed.
    #[error("cell {cell} value is {len} characters, limit is {max}")]
    ValueTooLong {
        /// Offending cell in A1 notation.
        cell: String,
        /// Actual length.
        len: usize,
        /// Limit that applied.
        max: usize,
    },

    /// An address or area could not be parsed.
    #[error("invalid cell address: {address}")]
    InvalidAddress {
        /// The unparseable input.
        address: String,
    },
}

/// Zero-based cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellAddress {
    /// Zero-based row.
    pub row: u32,
    /// Zero-based column.
    pub col: u32,
}

impl CellAddress {
    /// Creates an address from zero-based coordinates.
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parses an A1-style reference such as `B2` or `$AA$10`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAddress`] for malformed references
    /// or coordinates beyond the sheet limits.
    pub fn parse(a1: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidAddress { address: a1.to_owned() };
        let caps = CELL_REF.captures(a1.trim()).ok_or_else(invalid)?;

        let col = caps[1]
            .bytes()
            .fold(0u32, |acc, b| acc * 26 + u32::from(b.to_ascii_uppercase() - b'A' + 1))
            - 1;
        let row = caps[2].parse::<u32>().map_err(|_| invalid())? - 1;

        if row >= MAX_ROWS || col >= MAX_COLS {
            return Err(invalid());
        }
        Ok(Self { row, col })
    }
}

impl FromStr for CellAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut letters = Vec::new();
        let mut n = self.col + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(char::from(b'A' + rem as u8));
            n = (n - 1) / 26;
        }
        for letter in letters.iter().rev() {
            write!(f, "{letter}")?;
        }
        write!(f, "{}", u64::from(self.row) + 1)
    }
}

/// A rectangular range, optionally qualified by a sheet name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    sheet: Option<String>,
    start: CellAddress,
    end: CellAddress,
}

impl Area {
    /// Parses `B2:D10`, `B2`, `Sheet1!B2:D10` or `'My Sheet'!B2:D10`.
    ///
    /// Reversed corners (`D10:B2`) are normalized.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAddress`] if either corner is
    /// malformed.
    pub fn parse(notation: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidAddress { address: notation.to_owned() };
        let notation_trimmed = notation.trim();

        let (sheet, range) = match notation_trimmed.rsplit_once('!') {
            Some((sheet, range)) => {
                let sheet = sheet.trim_matches('\'');
                if sheet.is_empty() {
                    return Err(invalid());
                }
                (Some(sheet.to_owned()), range)
            },
            None => (None, notation_trimmed),
        };

        let (first, second) = match range.split_once(':') {
            Some((a, b)) => (CellAddress::parse(a)?, CellAddress::parse(b)?),
            None => {
                let cell = CellAddress::parse(range)?;
                (cell, cell)
            },
        };

        Ok(Self {
            sheet,
            start: CellAddress::new(first.row.min(second.row), first.col.min(second.col)),
            end: CellAddress::new(first.row.max(second.row), first.col.max(second.col)),
        })
    }

    /// Sheet qualifier, if any.
    #[must_use]
    pub fn sheet(&self) -> Option<&str> {
        self.sheet.as_deref()
    }

    /// Top-left corner.
    #[must_use]
    pub fn start(&self) -> CellAddress {
        self.start
    }

    /// Bottom-right corner.
    #[must_use]
    pub fn end(&self) -> CellAddress {
        self.end
    }

    /// Returns `true` if `cell` lies within the rectangle (inclusive).
    #[must_use]
    pub fn contains(&self, cell: CellAddress) -> bool {
        (self.start.row..=self.end.row).contains(&cell.row)
            && (self.start.col..=self.end.col).contains(&cell.col)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            write!(f, "'{sheet}'!")?;
        }
        write!(f, "{}:{}", self.start, self.end)
    }
}

/// A requested write to one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellWrite {
    /// Zero-based row.
    pub row: u32,
    /// Zero-based column.
    pub col: u32,
    /// New value. Strings starting with `=` are formulas.
    pub value: Value,
}

impl CellWrite {
    /// Creates a write from zero-based coordinates.
    #[must_use]
    pub fn new(row: u32, col: u32, value: impl Into<Value>) -> Self {
        Self { row, col, value: value.into() }
    }

    /// Creates a write from an A1 reference.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAddress`] for malformed references.
    pub fn at(a1: &str, value: impl Into<Value>) -> Result<Self, ValidationError> {
        let address = CellAddress::parse(a1)?;
        Ok(Self::new(address.row, address.col, value))
    }

    /// Target address.
    #[must_use]
    pub fn address(&self) -> CellAddress {
        CellAddress::new(self.row, self.col)
    }
}

/// A validated cell write.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedCell {
    /// Target address.
    pub address: CellAddress,
    /// Value, unchanged from the request.
    pub value: Value,
}

/// An update that passed [`validate_mutation`].
///
/// Can only be constructed by validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedUpdate {
    area: Area,
    cells: Vec<SanitizedCell>,
}

impl SanitizedUpdate {
    /// Area the update was validated against.
    #[must_use]
    pub fn area(&self) -> &Area {
        &self.area
    }

    /// Validated cells in request order.
    #[must_use]
    pub fn cells(&self) -> &[SanitizedCell] {
        &self.cells
    }

    /// Number of cells written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if the update writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Validates `update` against `allowed_area`.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found. Nothing from a rejected
/// update may be applied.
pub fn validate_mutation(
    update: &[CellWrite],
    allowed_area: &str,
) -> Result<SanitizedUpdate, ValidationError> {
    let area = Area::parse(allowed_area)?;
    let mut cells = Vec::with_capacity(update.len());

    for write in update {
        let address = write.address();
        if !area.contains(address) {
            return Err(ValidationError::OutOfArea {
                cell: address.to_string(),
                area: allowed_area.to_owned(),
            });
        }
        check_value(address, &write.value)?;
        cells.push(SanitizedCell { address, value: write.value.clone() });
    }

    Ok(SanitizedUpdate { area, cells })
}

fn check_value(address: CellAddress, value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        Value::Array(_) | Value::Object(_) => {
            Err(ValidationError::NestedValue { cell: address.to_string() })
        },
        Value::String(text) if text.starts_with('=') => check_formula(address, text),
        Value::String(text) => {
            check_len(address, text, MAX_TEXT_LEN)?;
            // Engines also evaluate `+`, `-` and `@` prefixed entries.
            if text.trim_start().starts_with(FORMULA_PREFIXES) {
                check_formula_code(address, text)
            } else {
                Ok(())
            }
        },
    }
}

const FORMULA_PREFIXES: [char; 4] = ['=', '+', '-', '@'];

fn check_len(address: CellAddress, text: &str, max: usize) -> Result<(), ValidationError> {
    let len = text.chars().count();
    if len > max {
        return Err(ValidationError::ValueTooLong { cell: address.to_string(), len, max });
    }
    Ok(())
}

fn check_formula(address: CellAddress, formula: &str) -> Result<(), ValidationError> {
    check_len(address, formula, MAX_FORMULA_LEN)?;
    check_formula_code(address, formula)
}

fn check_formula_code(address: CellAddress, formula: &str) -> Result<(), ValidationError> {
    // String literals may legitimately contain brackets or function names.
    let code = STRING_LITERAL.replace_all(formula, "\"\"");

    if EXTERNAL_SHEET_REF.is_match(&code) || EXTERNAL_WORKBOOK.is_match(&code) {
        return Err(ValidationError::ExternalReference { cell: address.to_string() });
    }
    if let Some(caps) = DENIED_CALL.captures(&code) {
        return Err(ValidationError::DeniedFunction {
            cell: address.to_string(),
            function: caps[1].to_ascii_uppercase(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("A1", 0, 0)]
    #[case("B2", 1, 1)]
    #[case("Z9", 8, 25)]
    #[case("AA10", 9, 26)]
    #[case("$D$10", 9, 3)]
    #[case("xfd1", 0, 16_383)]
    fn test_parse_cell(#[case] a1: &str, #[case] row: u32, #[case] col: u32) {
        let cell = CellAddress::parse(a1).unwrap();
        assert_eq!(cell, CellAddress::new(row, col));
    }

    #[rstest]
    #[case("")]
    #[case("A0")]
    #[case("1A")]
    #[case("AAAA1")]
    #[case("XFE1")]
    #[case("A1048577")]
    fn test_parse_cell_rejects(#[case] a1: &str) {
        assert!(matches!(CellAddress::parse(a1), Err(ValidationError::InvalidAddress { .. })));
    }

    #[rstest]
    #[case(CellAddress::new(0, 0), "A1")]
    #[case(CellAddress::new(9, 26), "AA10")]
    #[case(CellAddress::new(0, 701), "ZZ1")]
    #[case(CellAddress::new(0, 702), "AAA1")]
    fn test_display_cell(#[case] cell: CellAddress, #[case] expected: &str) {
        assert_eq!(cell.to_string(), expected);
        assert_eq!(CellAddress::parse(expected).unwrap(), cell);
    }

    #[test]
    fn test_area_parse_variants() {
        let area = Area::parse("B2:D10").unwrap();
        assert_eq!(area.start(), CellAddress::new(1, 1));
        assert_eq!(area.end(), CellAddress::new(9, 3));
        assert_eq!(area.sheet(), None);

        assert_eq!(Area::parse("D10:B2").unwrap(), area);

        let qualified = Area::parse("'Input Sheet'!B2:D10").unwrap();
        assert_eq!(qualified.sheet(), Some("Input Sheet"));
        assert_eq!(qualified.to_string(), "'Input Sheet'!B2:D10");

        let single = Area::parse("C3").unwrap();
        assert!(single.contains(CellAddress::new(2, 2)));
        assert!(!single.contains(CellAddress::new(2, 3)));
    }

    #[test]
    fn test_cell_outside_area_is_rejected() {
        let err = validate_mutation(&[CellWrite::new(0, 0, 5)], "B2:D10").unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfArea { cell: "A1".into(), area: "B2:D10".into() }
        );
    }

    #[test]
    fn test_cell_inside_area_passes_unchanged() {
        let update = vec![
            CellWrite::new(1, 1, 5),
            CellWrite::at("D10", "hello").unwrap(),
            CellWrite::new(4, 2, json!(null)),
            CellWrite::new(5, 2, "=SUM(B2:B5)"),
        ];
        let sanitized = validate_mutation(&update, "B2:D10").unwrap();

        assert_eq!(sanitized.len(), 4);
        for (cell, write) in sanitized.cells().iter().zip(&update) {
            assert_eq!(cell.address, write.address());
            assert_eq!(cell.value, write.value);
        }
    }

    #[test]
    fn test_all_or_nothing_rejects_on_any_violation() {
        let update = vec![CellWrite::new(1, 1, 1), CellWrite::new(1, 2, json!({ "a": 1 }))];
        let err = validate_mutation(&update, "B2:D10").unwrap_err();
        assert_eq!(err, ValidationError::NestedValue { cell: "C2".into() });
    }

    #[rstest]
    #[case(json!([1, 2]))]
    #[case(json!({ "nested": true }))]
    fn test_nested_values_rejected(#[case] value: Value) {
        let err = validate_mutation(&[CellWrite::new(1, 1, value)], "B2:D10").unwrap_err();
        assert!(matches!(err, ValidationError::NestedValue { .. }));
    }

    #[rstest]
    #[case("=[Budget.xlsx]Sheet1!A1")]
    #[case("='C:\\files\\[Budget.xlsx]Q1 Data'!B4*2")]
    #[case("=[1]Sheet1!A1+1")]
    #[case("=SUM([other.xlsm]Totals)")]
    fn test_external_references_rejected(#[case] formula: &str) {
        let err = validate_mutation(&[CellWrite::new(1, 1, formula)], "B2:D10").unwrap_err();
        assert_eq!(err, ValidationError::ExternalReference { cell: "B2".into() });
    }

    #[rstest]
    #[case("=WEBSERVICE(\"https://example.com\")", "WEBSERVICE")]
    #[case("=indirect(\"A\"&B2)", "INDIRECT")]
    #[case("=1+_xlfn.IMPORTXML(B3, \"//a\")", "IMPORTXML")]
    #[case("=IF(B2, HYPERLINK (\"x\"), 0)", "HYPERLINK")]
    #[case("=REGISTER.ID(\"lib\", \"fn\")", "REGISTER.ID")]
    fn test_denied_functions_rejected(#[case] formula: &str, #[case] function: &str) {
        let err = validate_mutation(&[CellWrite::new(1, 1, formula)], "B2:D10").unwrap_err();
        assert_eq!(
            err,
            ValidationError::DeniedFunction { cell: "B2".into(), function: function.into() }
        );
    }

    #[rstest]
    #[case("+WEBSERVICE(\"https://example.com\")", "WEBSERVICE")]
    #[case("-INDIRECT(\"A1\")", "INDIRECT")]
    #[case("@IMPORTXML(B3, \"//a\")", "IMPORTXML")]
    #[case("  =HYPERLINK(\"x\")", "HYPERLINK")]
    fn test_alternate_formula_prefixes_are_checked(#[case] entry: &str, #[case] function: &str) {
        let err = validate_mutation(&[CellWrite::new(1, 1, entry)], "B2:D10").unwrap_err();
        assert_eq!(
            err,
            ValidationError::DeniedFunction { cell: "B2".into(), function: function.into() }
        );
    }

    #[test]
    fn test_prefixed_external_reference_rejected() {
        let err =
            validate_mutation(&[CellWrite::new(1, 1, "+[Budget.xlsx]Sheet1!A1")], "B2:D10")
                .unwrap_err();
        assert_eq!(err, ValidationError::ExternalReference { cell: "B2".into() });
    }

    #[rstest]
    #[case("-5")]
    #[case("+1 555 0100")]
    #[case("@home")]
    #[case("- call WEBSERVICE later")]
    fn test_prefixed_plain_text_passes(#[case] text: &str) {
        assert!(validate_mutation(&[CellWrite::new(1, 1, text)], "B2:D10").is_ok());
    }

    #[rstest]
    #[case("=SUM(B2:C4)")]
    #[case("=\"see [notes.xlsx]Sheet!A1\"")]
    #[case("=\"call WEBSERVICE(\" & B2")]
    #[case("=MYINDIRECTION(B2)")]
    #[case("=VLOOKUP(B2, C2:D10, 2, FALSE)")]
    #[case("=Sales[Amount]+Sheet2!A1")]
    fn test_benign_formulas_pass(#[case] formula: &str) {
        assert!(validate_mutation(&[CellWrite::new(1, 1, formula)], "B2:D10").is_ok());
    }

    #[test]
    fn test_oversized_values_rejected() {
        let text = "x".repeat(MAX_TEXT_LEN + 1);
        let err = validate_mutation(&[CellWrite::new(1, 1, text)], "B2:D10").unwrap_err();
        assert!(matches!(err, ValidationError::ValueTooLong { max: MAX_TEXT_LEN, .. }));

        let formula = format!("={}", "1+".repeat(MAX_FORMULA_LEN));
        let err = validate_mutation(&[CellWrite::new(1, 1, formula)], "B2:D10").unwrap_err();
        assert!(matches!(err, ValidationError::ValueTooLong { max: MAX_FORMULA_LEN, .. }));
    }

    #[test]
    fn test_bad_area_is_rejected() {
        let err = validate_mutation(&[CellWrite::new(1, 1, 1)], "B2:").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAddress { .. }));
    }
}
