//! Delimited text tables (TSV / CSV)
//!
//! Reads the whole file into rows of string fields. Fields may be wrapped in
//! double quotes; a doubled quote inside a quoted field is a literal quote and
//! quoted fields may span lines.

use super::InputError;
use std::fs;
use std::path::Path;

/// Parsed table with a header row
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Read a `.tsv` or `.csv` file, choosing the delimiter by extension
    pub fn read(path: &Path) -> Result<Self, InputError> {
        let delimiter = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tsv") => '\t',
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ',',
            _ => return Err(InputError::UnsupportedTable(path.to_path_buf())),
        };

        let contents = fs::read_to_string(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&contents, delimiter).map_err(|reason| InputError::MalformedTable {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse table text with the given delimiter
    pub fn parse(contents: &str, delimiter: char) -> Result<Self, String> {
        let mut records = split_records(contents, delimiter)?.into_iter();
        let headers: Vec<String> = records
            .next()
            .ok_or_else(|| "missing header row".to_string())?
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (i, record) in records.enumerate() {
            if record.len() == 1 && record[0].trim().is_empty() {
                continue;
            }
            if record.len() != headers.len() {
                return Err(format!(
                    "row {} has {} fields, header has {}",
                    i + 2,
                    record.len(),
                    headers.len()
                ));
            }
            rows.push(record);
        }

        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a named column
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

fn split_records(contents: &str, delimiter: char) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = contents.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}
