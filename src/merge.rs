//! Turns stored portal responses into one CSV file.
//!
//! Portal result files are semicolon separated, may end lines with a stray
//! separator and mark missing values with `..`.

use std::collections::HashSet;
use std::io::Write;

use crate::{Error, Result};

pub const SORT_COLUMNS: [&str; 4] = ["Region", "Brott", "År", "Period"];
pub const MISSING_VALUE: &str = "..";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn column(&self, name: &str) -> Result<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }

    /// Stable sort on [`SORT_COLUMNS`].
    fn sort(&mut self) -> Result<()> {
        let keys = SORT_COLUMNS
            .iter()
            .map(|name| self.column(name))
            .collect::<Result<Vec<_>>>()?;
        self.rows.sort_by(|a, b| {
            keys.iter()
                .map(|&k| a[k].cmp(&b[k]))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }
}

fn dedup_rows(rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter().filter(|row| seen.insert(row.clone())).collect()
}

/// Parses one raw response: strips trailing separators, drops duplicate rows
/// and sorts by region, crime, year and period.
pub fn normalize_response(raw: &str) -> Result<Table> {
    let cleaned = raw
        .lines()
        .map(|line| line.strip_suffix(';').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_reader(cleaned.as_bytes());
    let header = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }

    let mut table = Table {
        header,
        rows: dedup_rows(rows),
    };
    table.sort()?;
    Ok(table)
}

/// Merges tables under the first table's header. Rows with a missing value
/// are dropped, duplicates are removed and the result is sorted.
pub fn combine(tables: &[Table]) -> Result<Table> {
    let Some(first) = tables.first() else {
        return Ok(Table::default());
    };
    let header = first.header.clone();

    let mut rows = Vec::new();
    for table in tables {
        let order = header
            .iter()
            .map(|name| table.column(name))
            .collect::<Result<Vec<_>>>()?;
        for row in &table.rows {
            if row.iter().any(|cell| cell == MISSING_VALUE) {
                continue;
            }
            rows.push(order.iter().map(|&i| row[i].clone()).collect());
        }
    }

    let mut merged = Table {
        header,
        rows: dedup_rows(rows),
    };
    merged.sort()?;
    Ok(merged)
}

/// Writes `table` as comma-separated CSV.
pub fn write_csv<W: Write>(table: &Table, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(&table.header)?;
    for row in &table.rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}
