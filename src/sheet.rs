// Spreadsheet and key-log marshaling for the token jobs. Reading goes
// through `calamine` (first worksheet only), writing through
// `rust_xlsxwriter`.

use calamine::{open_workbook_auto, Data, Range, Reader};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{ApiError, Result};

/// A `(name, key)` pair as stored in the token spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRow {
    pub name: String,
    pub key: String,
}

/// Columns in an xlsx sheet, `A` through `XFD`.
const MAX_COLUMNS: u32 = 16_384;

/// Zero-based index of a spreadsheet column letter: `A` -> 0, `AA` -> 26.
pub fn column_index(column: &str) -> Result<u32> {
    let column = column.trim();
    if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ApiError::Sheet(format!("invalid column `{column}`")));
    }
    let n = column
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0u32, |acc, b| acc.checked_mul(26)?.checked_add(u32::from(b - b'A' + 1)))
        .filter(|&n| n <= MAX_COLUMNS)
        .ok_or_else(|| ApiError::Sheet(format!("invalid column `{column}`")))?;
    Ok(n - 1)
}

fn first_sheet(path: &Path) -> Result<Range<Data>> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ApiError::Sheet(format!("{}: {e}", path.display())))?;
    workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ApiError::Sheet(format!("{} has no worksheet", path.display())))?
        .map_err(|e| ApiError::Sheet(e.to_string()))
}

/// Cell value as trimmed text; `None` for empty cells and errors. Whole
/// floats lose their `.0` so numeric ids read back as written.
fn cell_raw(cell: &Data) -> Option<String> {
    Some(match cell {
        Data::Empty | Data::Error(_) => return None,
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Int(i) => i.to_string(),
        other => other.to_string().trim().to_string(),
    })
}

fn cell_text(cell: &Data) -> Option<String> {
    cell_raw(cell).filter(|text| !text.is_empty())
}

/// Rows `first_row..` (zero-based, absolute) of the used range.
fn rows_from(range: &Range<Data>, first_row: u32) -> std::ops::Range<u32> {
    let last = range.end().map(|(row, _)| row + 1).unwrap_or(0);
    first_row..last
}

/// Values of one column, optionally skipping a header row. Empty cells
/// are dropped; whitespace-only strings are kept as `""` so the caller
/// can report them.
pub fn read_column(path: &Path, column: &str, has_header: bool) -> Result<Vec<String>> {
    let col = column_index(column)?;
    let range = first_sheet(path)?;
    let first = u32::from(has_header);
    Ok(rows_from(&range, first)
        .filter_map(|row| range.get_value((row, col)).and_then(cell_raw))
        .collect())
}

/// `(name, key)` rows from row 2 on, where both cells are present.
pub fn read_token_rows(path: &Path) -> Result<Vec<TokenRow>> {
    let range = first_sheet(path)?;
    Ok(rows_from(&range, 1)
        .filter_map(|row| {
            let name = range.get_value((row, 0)).and_then(cell_text)?;
            let key = range.get_value((row, 1)).and_then(cell_text)?;
            Some(TokenRow { name, key })
        })
        .collect())
}

/// Write the created tokens with a styled header row.
pub fn write_token_sheet(path: &Path, rows: &[TokenRow]) -> Result<()> {
    let sheet_err = |e: rust_xlsxwriter::XlsxError| ApiError::Sheet(e.to_string());

    let mut workbook = Workbook::new();
    let header = Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x4472C4))
        .set_align(FormatAlign::Center);

    let sheet = workbook.add_worksheet();
    sheet.set_name("Tokens").map_err(sheet_err)?;
    sheet
        .write_string_with_format(0, 0, "Token name (name)", &header)
        .map_err(sheet_err)?;
    sheet
        .write_string_with_format(0, 1, "Token key (key)", &header)
        .map_err(sheet_err)?;
    for (i, row) in rows.iter().enumerate() {
        let r = i as u32 + 1;
        sheet.write_string(r, 0, &row.name).map_err(sheet_err)?;
        sheet.write_string(r, 1, &row.key).map_err(sheet_err)?;
    }
    sheet.set_column_width(0, 35).map_err(sheet_err)?;
    sheet.set_column_width(1, 50).map_err(sheet_err)?;

    workbook.save(path).map_err(sheet_err)
}

/// Pull `sk-` keys out of log lines shaped like `prefix | sk-xxxx`.
/// Duplicates are dropped, first occurrence wins.
pub fn extract_keys_from_log(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| line.contains('|'))
        .filter_map(|line| line.rsplit('|').next().map(str::trim))
        .filter(|key| key.starts_with("sk-"))
        .filter(|key| seen.insert(key.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn read_key_log(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(extract_keys_from_log(&text))
}
