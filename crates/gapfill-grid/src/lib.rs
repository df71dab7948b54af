#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use gapfill_domain::{is_iso_date, CellValue, ColumnInsertionResult, RowNeedingData};
use serde::{Deserialize, Serialize};

pub const LABEL_COLUMN: u32 = 1;
pub const DATE_HEADER_ROW: u32 = 1;
pub const PERIOD_HEADER_ROW: u32 = 2;
pub const FIRST_DATA_ROW: u32 = 3;
/// New reporting periods are inserted directly right of the label column.
pub const PERIOD_INSERT_COLUMN: u32 = 2;

const MAX_COLUMN: u32 = 16_384;
const MAX_ROW: u32 = 1_048_576;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GridError {
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("invalid cell reference: '{0}'")]
    InvalidReference(String),
    #[error("cell {sheet}!{cell} already holds a value")]
    CellOccupied { sheet: String, cell: String },
    #[error("invalid column index: {0}")]
    InvalidColumnIndex(u32),
    #[error("workbook codec error: {0}")]
    Codec(String),
}

impl GridError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SheetNotFound(_) => "sheet_not_found",
            Self::InvalidReference(_) => "invalid_reference",
            Self::CellOccupied { .. } => "cell_occupied",
            Self::InvalidColumnIndex(_) => "invalid_column_index",
            Self::Codec(_) => "codec_error",
        }
    }
}

/// A 1-based A1-style cell position. Ordering is row-major.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CellRef {
    pub row: u32,
    pub column: u32,
}

impl CellRef {
    #[must_use]
    pub fn new(column: u32, row: u32) -> Self {
        Self { row, column }
    }

    /// Parse an A1 reference such as `B3` or `aa10`.
    ///
    /// # Errors
    /// Returns [`GridError::InvalidReference`] when the text is not a reference inside the sheet bounds.
    pub fn parse(input: &str) -> Result<Self, GridError> {
        let invalid = || GridError::InvalidReference(input.to_string());
        let trimmed = input.trim();
        let split = trimmed.find(|ch: char| ch.is_ascii_digit()).ok_or_else(invalid)?;
        let (letters, digits) = trimmed.split_at(split);
        if letters.is_empty()
            || letters.len() > 3
            || !letters.chars().all(|ch| ch.is_ascii_alphabetic())
            || !digits.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(invalid());
        }

        let column = column_index(letters).ok_or_else(invalid)?;
        let row: u32 = digits.parse().map_err(|_| invalid())?;
        if row == 0 || row > MAX_ROW || column > MAX_COLUMN {
            return Err(invalid());
        }
        Ok(Self { row, column })
    }
}

impl Display for CellRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", column_letters(self.column), self.row)
    }
}

/// Convert a 1-based column index to letters: 1 -> A, 26 -> Z, 27 -> AA.
#[must_use]
pub fn column_letters(column: u32) -> String {
    let mut letters = Vec::new();
    let mut n = column;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Convert column letters to a 1-based index.
#[must_use]
pub fn column_index(letters: &str) -> Option<u32> {
    let mut column: u32 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = u32::from(ch.to_ascii_uppercase()) - u32::from('A') + 1;
        column = column.checked_mul(26)?.checked_add(digit)?;
    }
    if column == 0 {
        None
    } else {
        Some(column)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FontStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical: Option<String>,
    #[serde(default)]
    pub wrap_text: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BorderStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<String>,
}

/// Visual formatting carried by a cell independently of its value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<FontStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<Alignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border: Option<BorderStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
}

impl CellStyle {
    #[must_use]
    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    pub value: Option<CellValue>,
    pub style: CellStyle,
}

impl Cell {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.value {
            None => true,
            Some(CellValue::Text(text)) => text.trim().is_empty(),
            Some(CellValue::Number(_) | CellValue::Bool(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    name: String,
    cells: BTreeMap<CellRef, Cell>,
    column_widths: BTreeMap<u32, f64>,
}

impl Sheet {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            column_widths: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cell(&self, at: CellRef) -> Option<&Cell> {
        self.cells.get(&at)
    }

    #[must_use]
    pub fn value(&self, at: CellRef) -> Option<&CellValue> {
        self.cells
            .get(&at)
            .filter(|cell| !cell.is_empty())
            .and_then(|cell| cell.value.as_ref())
    }

    #[must_use]
    pub fn is_empty_at(&self, at: CellRef) -> bool {
        match self.cells.get(&at) {
            Some(cell) => cell.is_empty(),
            None => true,
        }
    }

    pub fn set_value(&mut self, at: CellRef, value: CellValue) {
        self.cells.entry(at).or_default().value = Some(value);
    }

    pub fn set_style(&mut self, at: CellRef, style: CellStyle) {
        self.cells.entry(at).or_default().style = style;
    }

    #[must_use]
    pub fn column_width(&self, column: u32) -> Option<f64> {
        self.column_widths.get(&column).copied()
    }

    pub fn set_column_width(&mut self, column: u32, width: f64) {
        self.column_widths.insert(column, width);
    }

    /// Highest row holding a value, 0 for a blank sheet.
    #[must_use]
    pub fn last_row(&self) -> u32 {
        self.cells
            .iter()
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(at, _)| at.row)
            .max()
            .unwrap_or(0)
    }

    /// Highest column holding a value, 0 for a blank sheet.
    #[must_use]
    pub fn last_column(&self) -> u32 {
        self.cells
            .iter()
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(at, _)| at.column)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn row_label(&self, row: u32) -> Option<String> {
        self.value(CellRef::new(LABEL_COLUMN, row))
            .map(ToString::to_string)
    }

    /// Empty cells in columns B..=last column on labelled rows, row-major.
    #[must_use]
    pub fn empty_cells(&self, rows: RangeInclusive<u32>) -> Vec<CellRef> {
        let last_column = self.last_column();
        let mut empty = Vec::new();
        for row in rows {
            if self.row_label(row).is_none() {
                continue;
            }
            for column in (LABEL_COLUMN + 1)..=last_column {
                let at = CellRef::new(column, row);
                if self.is_empty_at(at) {
                    empty.push(at);
                }
            }
        }
        empty
    }

    /// Date of the leftmost column (from B) whose row-1 header starts with `YYYY-MM-DD`.
    #[must_use]
    pub fn leftmost_period_date(&self) -> Option<String> {
        (LABEL_COLUMN + 1..=self.last_column()).find_map(|column| {
            match self.value(CellRef::new(column, DATE_HEADER_ROW)) {
                Some(CellValue::Text(text)) if is_iso_date(text.trim()) => {
                    Some(text.trim()[..10].to_string())
                }
                _ => None,
            }
        })
    }

    fn insert_column(
        &mut self,
        index: u32,
        date_header: &str,
        period_header: &str,
    ) -> Result<ColumnInsertionResult, GridError> {
        if index <= LABEL_COLUMN || index >= MAX_COLUMN {
            return Err(GridError::InvalidColumnIndex(index));
        }
        if self.cells.keys().any(|at| at.column >= MAX_COLUMN) {
            return Err(GridError::InvalidColumnIndex(index));
        }

        let shifted: Vec<CellRef> = self
            .cells
            .keys()
            .filter(|at| at.column >= index)
            .copied()
            .collect();
        let mut moved = Vec::with_capacity(shifted.len());
        for at in shifted {
            if let Some(cell) = self.cells.remove(&at) {
                moved.push((CellRef::new(at.column + 1, at.row), cell));
            }
        }
        self.cells.extend(moved);

        let widths: Vec<(u32, f64)> = self
            .column_widths
            .range(index..)
            .map(|(column, width)| (*column, *width))
            .collect();
        for (column, _) in &widths {
            self.column_widths.remove(column);
        }
        for (column, width) in widths {
            self.column_widths.insert(column + 1, width);
        }
        if let Some(width) = self.column_width(index + 1) {
            self.column_widths.insert(index, width);
        }

        for (row, header) in [(DATE_HEADER_ROW, date_header), (PERIOD_HEADER_ROW, period_header)] {
            let style = self
                .cell(CellRef::new(index + 1, row))
                .map(|cell| cell.style.clone())
                .unwrap_or_default();
            self.cells.insert(
                CellRef::new(index, row),
                Cell {
                    value: Some(CellValue::Text(header.to_string())),
                    style,
                },
            );
        }

        let mut rows_needing_data = Vec::new();
        for row in FIRST_DATA_ROW..=self.last_row() {
            if self.is_empty_at(CellRef::new(index + 1, row)) {
                continue;
            }
            rows_needing_data.push(RowNeedingData {
                row,
                label: self.row_label(row).unwrap_or_default(),
                target_cell: CellRef::new(index, row).to_string(),
            });
        }

        let summary = format!(
            "Inserted column {} on sheet '{}' with headers '{}' / '{}'; {} rows need data",
            column_letters(index),
            self.name,
            date_header,
            period_header,
            rows_needing_data.len()
        );
        Ok(ColumnInsertionResult {
            success: true,
            rows_needing_data,
            summary,
        })
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!(
            "### Sheet: {} ({} rows x {} cols)\n",
            self.name,
            self.last_row(),
            self.last_column()
        ));
        let last_column = self.last_column();
        for row in 1..=self.last_row() {
            let cells: Vec<String> = (1..=last_column)
                .map(|column| {
                    let at = CellRef::new(column, row);
                    match self.value(at) {
                        Some(value) => format!("{at}={value}"),
                        None => format!("{at}=<empty>"),
                    }
                })
                .collect();
            out.push_str(&format!("Row {row}: {}\n", cells.join(" | ")));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }

    #[must_use]
    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    #[must_use]
    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|sheet| sheet.name.clone()).collect()
    }

    /// # Errors
    /// Returns [`GridError::SheetNotFound`] for an unknown sheet name.
    pub fn sheet(&self, name: &str) -> Result<&Sheet, GridError> {
        self.sheets
            .iter()
            .find(|sheet| sheet.name == name)
            .ok_or_else(|| GridError::SheetNotFound(name.to_string()))
    }

    /// # Errors
    /// Returns [`GridError::SheetNotFound`] for an unknown sheet name.
    pub fn sheet_mut(&mut self, name: &str) -> Result<&mut Sheet, GridError> {
        self.sheets
            .iter_mut()
            .find(|sheet| sheet.name == name)
            .ok_or_else(|| GridError::SheetNotFound(name.to_string()))
    }

    /// # Errors
    /// Returns an error for an unknown sheet or a malformed reference.
    pub fn read_cell(&self, sheet: &str, reference: &str) -> Result<Option<CellValue>, GridError> {
        let at = CellRef::parse(reference)?;
        Ok(self.sheet(sheet)?.value(at).cloned())
    }

    /// Write a value unconditionally, keeping the cell's style.
    ///
    /// # Errors
    /// Returns an error for an unknown sheet or a malformed reference.
    pub fn write_cell(
        &mut self,
        sheet: &str,
        reference: &str,
        value: CellValue,
    ) -> Result<(), GridError> {
        let at = CellRef::parse(reference)?;
        self.sheet_mut(sheet)?.set_value(at, value);
        Ok(())
    }

    /// Write a value only when the target cell is currently empty.
    ///
    /// # Errors
    /// Returns [`GridError::CellOccupied`] when the cell already holds a value.
    pub fn fill_empty_cell(
        &mut self,
        sheet: &str,
        reference: &str,
        value: CellValue,
    ) -> Result<CellRef, GridError> {
        let at = CellRef::parse(reference)?;
        let target = self.sheet_mut(sheet)?;
        if !target.is_empty_at(at) {
            return Err(GridError::CellOccupied {
                sheet: sheet.to_string(),
                cell: at.to_string(),
            });
        }
        target.set_value(at, value);
        Ok(at)
    }

    /// # Errors
    /// Returns [`GridError::SheetNotFound`] for an unknown sheet name.
    pub fn list_empty_cells(
        &self,
        sheet: &str,
        rows: RangeInclusive<u32>,
    ) -> Result<Vec<String>, GridError> {
        Ok(self
            .sheet(sheet)?
            .empty_cells(rows)
            .into_iter()
            .map(|at| at.to_string())
            .collect())
    }

    /// Every empty data cell in the workbook, keyed by sheet name in sheet order.
    #[must_use]
    pub fn empty_cells_by_sheet(&self) -> Vec<(String, Vec<String>)> {
        self.sheets
            .iter()
            .map(|sheet| {
                let cells = sheet
                    .empty_cells(FIRST_DATA_ROW..=sheet.last_row())
                    .into_iter()
                    .map(|at| at.to_string())
                    .collect();
                (sheet.name.clone(), cells)
            })
            .collect()
    }

    /// Shift columns at or after `index` right by one and write the new period headers.
    ///
    /// # Errors
    /// Returns an error for an unknown sheet or an index outside `B..` the sheet bounds.
    pub fn insert_column_at(
        &mut self,
        sheet: &str,
        index: u32,
        date_header: &str,
        period_header: &str,
    ) -> Result<ColumnInsertionResult, GridError> {
        self.sheet_mut(sheet)?
            .insert_column(index, date_header, period_header)
    }

    /// Leftmost period date of the first sheet that has a dated column.
    #[must_use]
    pub fn leftmost_period_date(&self) -> Option<String> {
        self.sheets.iter().find_map(Sheet::leftmost_period_date)
    }

    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for sheet in &self.sheets {
            sheet.render(&mut out);
        }
        out
    }
}

/// True when `period_end` is strictly newer than the leftmost dated column.
///
/// ISO dates compare correctly as strings, so the comparison is lexical.
#[must_use]
pub fn needs_new_column(leftmost_date: Option<&str>, period_end: &str) -> bool {
    leftmost_date.is_some_and(|leftmost| period_end > leftmost)
}

pub trait WorkbookCodec {
    fn extension(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn decode(&self, bytes: &[u8]) -> Result<Workbook, GridError>;

    #[allow(clippy::missing_errors_doc)]
    fn encode(&self, workbook: &Workbook) -> Result<Vec<u8>, GridError>;
}

/// Load a workbook from disk through a codec.
///
/// # Errors
/// Returns [`GridError::Codec`] when the file cannot be read or decoded.
pub fn load_workbook(path: &Path, codec: &dyn WorkbookCodec) -> Result<Workbook, GridError> {
    let bytes = fs::read(path)
        .map_err(|err| GridError::Codec(format!("read {}: {err}", path.display())))?;
    codec.decode(&bytes)
}

/// Persist a workbook to disk through a codec.
///
/// # Errors
/// Returns [`GridError::Codec`] when encoding or writing fails.
pub fn save_workbook(
    path: &Path,
    workbook: &Workbook,
    codec: &dyn WorkbookCodec,
) -> Result<(), GridError> {
    let bytes = codec.encode(workbook)?;
    fs::write(path, bytes)
        .map_err(|err| GridError::Codec(format!("write {}: {err}", path.display())))
}

/// Workbook stored as a JSON document: sheets, sparse cells keyed by A1 reference, column widths.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWorkbookCodec;

#[derive(Debug, Serialize, Deserialize)]
struct WorkbookFile {
    sheets: Vec<SheetFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SheetFile {
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    column_widths: BTreeMap<String, f64>,
    #[serde(default)]
    cells: Vec<CellFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellFile {
    #[serde(rename = "ref")]
    reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<CellValue>,
    #[serde(default, skip_serializing_if = "CellStyle::is_default")]
    style: CellStyle,
}

impl WorkbookCodec for JsonWorkbookCodec {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Workbook, GridError> {
        let file: WorkbookFile = serde_json::from_slice(bytes)
            .map_err(|err| GridError::Codec(format!("invalid workbook json: {err}")))?;
        let mut workbook = Workbook::new();
        for sheet_file in file.sheets {
            let mut sheet = Sheet::new(sheet_file.name);
            for (letters, width) in sheet_file.column_widths {
                let column = column_index(&letters)
                    .ok_or_else(|| GridError::InvalidReference(letters.clone()))?;
                sheet.set_column_width(column, width);
            }
            for cell_file in sheet_file.cells {
                let at = CellRef::parse(&cell_file.reference)?;
                sheet.cells.insert(
                    at,
                    Cell {
                        value: cell_file.value,
                        style: cell_file.style,
                    },
                );
            }
            workbook.add_sheet(sheet);
        }
        Ok(workbook)
    }

    fn encode(&self, workbook: &Workbook) -> Result<Vec<u8>, GridError> {
        let sheets = workbook
            .sheets
            .iter()
            .map(|sheet| SheetFile {
                name: sheet.name.clone(),
                column_widths: sheet
                    .column_widths
                    .iter()
                    .map(|(column, width)| (column_letters(*column), *width))
                    .collect(),
                cells: sheet
                    .cells
                    .iter()
                    .filter(|(_, cell)| cell.value.is_some() || !cell.style.is_default())
                    .map(|(at, cell)| CellFile {
                        reference: at.to_string(),
                        value: cell.value.clone(),
                        style: cell.style.clone(),
                    })
                    .collect(),
            })
            .collect();
        serde_json::to_vec_pretty(&WorkbookFile { sheets })
            .map_err(|err| GridError::Codec(format!("encode workbook json: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        column_letters, needs_new_column, CellRef, CellStyle, FontStyle, GridError,
        JsonWorkbookCodec, Sheet, Workbook, WorkbookCodec, FIRST_DATA_ROW, PERIOD_INSERT_COLUMN,
    };
    use gapfill_domain::CellValue;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, GridError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn at(reference: &str) -> CellRef {
        must(CellRef::parse(reference))
    }

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.to_string())
    }

    fn header_style() -> CellStyle {
        CellStyle {
            font: Some(FontStyle {
                bold: true,
                ..FontStyle::default()
            }),
            fill: Some("FFDDEBF7".to_string()),
            number_format: Some("yyyy-mm-dd".to_string()),
            ..CellStyle::default()
        }
    }

    /// Income sheet: B holds the latest quarter, C the prior one, B4 missing.
    fn fixture_workbook() -> Workbook {
        let mut sheet = Sheet::new("Income");
        sheet.set_value(at("A1"), text("Item"));
        sheet.set_value(at("B1"), text("2025-09-30"));
        sheet.set_style(at("B1"), header_style());
        sheet.set_value(at("C1"), text("2025-06-30"));
        sheet.set_value(at("B2"), text("Q3 2025"));
        sheet.set_style(at("B2"), header_style());
        sheet.set_value(at("C2"), text("Q2 2025"));
        sheet.set_value(at("A3"), text("Revenue"));
        sheet.set_value(at("B3"), CellValue::Number(102_466_000_000.0));
        sheet.set_value(at("C3"), CellValue::Number(94_036_000_000.0));
        sheet.set_value(at("A4"), text("Cost of Revenue"));
        sheet.set_value(at("C4"), CellValue::Number(50_318_000_000.0));
        sheet.set_value(at("A5"), text("Gross Profit"));
        sheet.set_value(at("B5"), CellValue::Number(48_341_000_000.0));
        sheet.set_value(at("C5"), CellValue::Number(43_718_000_000.0));
        sheet.set_column_width(2, 14.5);

        let mut workbook = Workbook::new();
        workbook.add_sheet(sheet);
        workbook
    }

    #[test]
    fn parses_and_formats_a1_references() {
        assert_eq!(at("B3"), CellRef::new(2, 3));
        assert_eq!(at("aa10"), CellRef::new(27, 10));
        assert_eq!(CellRef::new(703, 1).to_string(), "AAA1");
        for bad in ["", "3B", "B0", "B", "B3C", "ZZZZ1", "B-1"] {
            assert!(CellRef::parse(bad).is_err(), "expected '{bad}' to be rejected");
        }
    }

    #[test]
    fn read_and_write_report_unknown_sheet() {
        let mut workbook = fixture_workbook();
        assert_eq!(
            must(workbook.read_cell("Income", "B3")),
            Some(CellValue::Number(102_466_000_000.0))
        );
        assert_eq!(must(workbook.read_cell("Income", "B4")), None);
        assert_eq!(
            workbook.read_cell("Balance", "B3"),
            Err(GridError::SheetNotFound("Balance".to_string()))
        );
        assert!(workbook
            .write_cell("Balance", "B3", CellValue::Number(1.0))
            .is_err());
    }

    #[test]
    fn fill_empty_cell_refuses_occupied_cells() {
        let mut workbook = fixture_workbook();
        let written = must(workbook.fill_empty_cell(
            "Income",
            "B4",
            CellValue::Number(54_125_000_000.0),
        ));
        assert_eq!(written.to_string(), "B4");

        let rejected = workbook.fill_empty_cell("Income", "B3", CellValue::Number(1.0));
        assert_eq!(
            rejected,
            Err(GridError::CellOccupied {
                sheet: "Income".to_string(),
                cell: "B3".to_string(),
            })
        );
        assert_eq!(
            must(workbook.read_cell("Income", "B3")),
            Some(CellValue::Number(102_466_000_000.0))
        );
    }

    #[test]
    fn lists_empty_cells_on_labelled_rows_only() {
        let mut workbook = fixture_workbook();
        must(workbook.sheet_mut("Income")).set_value(at("A7"), text("Operating Income"));
        must(workbook.sheet_mut("Income")).set_value(at("B7"), CellValue::Number(1.0));

        let empty = must(workbook.list_empty_cells("Income", FIRST_DATA_ROW..=7));
        assert_eq!(empty, vec!["B4".to_string(), "C7".to_string()]);
    }

    #[test]
    fn insert_column_shifts_values_and_copies_header_styles() {
        let mut workbook = fixture_workbook();
        let result = must(workbook.insert_column_at(
            "Income",
            PERIOD_INSERT_COLUMN,
            "2025-12-31",
            "Q4 2025",
        ));

        assert!(result.success);
        let rows: Vec<(u32, &str, &str)> = result
            .rows_needing_data
            .iter()
            .map(|row| (row.row, row.label.as_str(), row.target_cell.as_str()))
            .collect();
        assert_eq!(rows, vec![(3, "Revenue", "B3"), (5, "Gross Profit", "B5")]);

        let sheet = must(workbook.sheet("Income"));
        assert_eq!(sheet.value(at("B1")), Some(&text("2025-12-31")));
        assert_eq!(sheet.value(at("B2")), Some(&text("Q4 2025")));
        assert_eq!(sheet.value(at("C1")), Some(&text("2025-09-30")));
        assert_eq!(sheet.value(at("D3")), Some(&CellValue::Number(94_036_000_000.0)));
        assert!(sheet.is_empty_at(at("B3")));
        assert_eq!(
            sheet.cell(at("B1")).map(|cell| cell.style.clone()),
            Some(header_style())
        );
        assert_eq!(sheet.column_width(2), Some(14.5));
        assert_eq!(sheet.column_width(3), Some(14.5));
        assert_eq!(sheet.leftmost_period_date().as_deref(), Some("2025-12-31"));
    }

    #[test]
    fn insert_column_rejects_label_column_and_unknown_sheet() {
        let mut workbook = fixture_workbook();
        assert_eq!(
            workbook.insert_column_at("Income", 1, "2025-12-31", "Q4"),
            Err(GridError::InvalidColumnIndex(1))
        );
        assert!(matches!(
            workbook.insert_column_at("Cash", 2, "2025-12-31", "Q4"),
            Err(GridError::SheetNotFound(_))
        ));
    }

    #[test]
    fn new_column_detection_is_strictly_newer() {
        let workbook = fixture_workbook();
        let leftmost = workbook.leftmost_period_date();
        assert_eq!(leftmost.as_deref(), Some("2025-09-30"));
        assert!(needs_new_column(leftmost.as_deref(), "2025-12-31"));
        assert!(!needs_new_column(leftmost.as_deref(), "2025-09-30"));
        assert!(!needs_new_column(leftmost.as_deref(), "2025-06-30"));
        assert!(!needs_new_column(None, "2025-12-31"));
    }

    #[test]
    fn json_codec_preserves_values_styles_and_widths() {
        let workbook = fixture_workbook();
        let codec = JsonWorkbookCodec;
        let bytes = must(codec.encode(&workbook));
        let decoded = must(codec.decode(&bytes));
        assert_eq!(decoded, workbook);
        assert!(codec.decode(b"{\"sheets\": 3}").is_err());
    }

    #[test]
    fn render_text_marks_empty_cells() {
        let rendered = fixture_workbook().render_text();
        assert!(rendered.contains("### Sheet: Income (5 rows x 3 cols)"));
        assert!(rendered.contains("B4=<empty>"));
        assert!(rendered.contains("A3=Revenue | B3=102466000000"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_a1_references_survive_formatting(column in 1u32..=16_384, row in 1u32..=1_048_576) {
            let reference = CellRef::new(column, row);
            let text = reference.to_string();
            prop_assert!(text.starts_with(&column_letters(column)));
            prop_assert_eq!(CellRef::parse(&text), Ok(reference));
        }

        #[test]
        fn prop_insertion_reports_every_shifted_value(filled in prop::collection::vec(any::<bool>(), 1..40)) {
            let mut sheet = Sheet::new("Data");
            sheet.set_value(CellRef::new(2, 1), CellValue::Text("2025-03-31".to_string()));
            let mut expected_rows = Vec::new();
            for (offset, has_value) in filled.iter().enumerate() {
                let row = FIRST_DATA_ROW + u32::try_from(offset).unwrap_or(0);
                sheet.set_value(CellRef::new(1, row), CellValue::Text(format!("line {row}")));
                if *has_value {
                    sheet.set_value(CellRef::new(2, row), CellValue::Number(f64::from(row)));
                    expected_rows.push(row);
                }
            }
            let mut workbook = Workbook::new();
            workbook.add_sheet(sheet);

            let result = workbook.insert_column_at("Data", 2, "2025-06-30", "Q2");
            prop_assert!(result.is_ok());
            let result = result.unwrap_or_else(|_| unreachable!());
            let rows: Vec<u32> = result.rows_needing_data.iter().map(|row| row.row).collect();
            prop_assert_eq!(&rows, &expected_rows);

            let sheet = workbook.sheet("Data").unwrap_or_else(|_| unreachable!());
            for row in expected_rows {
                prop_assert_eq!(sheet.value(CellRef::new(3, row)), Some(&CellValue::Number(f64::from(row))));
                prop_assert!(sheet.is_empty_at(CellRef::new(2, row)));
            }
        }
    }
}
