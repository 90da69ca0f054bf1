use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::PlateRecord;
use crate::plate::normalize;

const HEADER: &str = "plate,authorized";
const TRUE_LITERAL: &str = "True";
const FALSE_LITERAL: &str = "False";

/// Backing store for the plate registry.
///
/// Stores are whole-file: `load` returns every record, `save` replaces them
/// all. There are no partial updates.
pub trait PlateStore: Send {
    fn load(&self) -> Result<Vec<PlateRecord>>;

    fn save(&self, records: &[PlateRecord]) -> Result<()>;
}

/// Header-first CSV file with columns `plate,authorized`.
///
/// `authorized` is written as `True` / `False`. A missing file reads as an
/// empty registry.
#[derive(Clone, Debug)]
pub struct CsvPlateStore {
    path: PathBuf,
}

impl CsvPlateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlateStore for CsvPlateStore {
    fn load(&self) -> Result<Vec<PlateRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read plate store {}", self.path.display()))?;
        parse_csv(&raw).with_context(|| format!("parse plate store {}", self.path.display()))
    }

    fn save(&self, records: &[PlateRecord]) -> Result<()> {
        // Write beside the target and rename so readers never see a torn file.
        let tmp = self.path.with_extension("csv.tmp");
        std::fs::write(&tmp, render_csv(records))
            .with_context(|| format!("write plate store {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace plate store {}", self.path.display()))?;
        Ok(())
    }
}

pub(crate) fn parse_csv(raw: &str) -> Result<Vec<PlateRecord>> {
    let mut lines = raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty());

    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = split_row(header)
        .into_iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let plate_idx = columns
        .iter()
        .position(|c| c == "plate")
        .ok_or_else(|| anyhow!("missing 'plate' column in header"))?;
    let authorized_idx = columns
        .iter()
        .position(|c| c == "authorized")
        .ok_or_else(|| anyhow!("missing 'authorized' column in header"))?;

    let mut records: Vec<PlateRecord> = Vec::new();
    for line in lines {
        let fields = split_row(line);
        let plate = normalize(fields.get(plate_idx).map(String::as_str).unwrap_or(""));
        if plate.is_empty() {
            log::warn!("plate store: skipping row without plate: {:?}", line);
            continue;
        }
        if records.iter().any(|r| r.plate == plate) {
            log::warn!("plate store: duplicate plate {} ignored", plate);
            continue;
        }
        let authorized = fields
            .get(authorized_idx)
            .map(|v| v.eq_ignore_ascii_case(TRUE_LITERAL))
            .unwrap_or(false);
        records.push(PlateRecord { plate, authorized });
    }
    Ok(records)
}

pub(crate) fn render_csv(records: &[PlateRecord]) -> String {
    let mut out = String::with_capacity(HEADER.len() + 2 + records.len() * 16);
    out.push_str(HEADER);
    out.push_str("\r\n");
    for record in records {
        out.push_str(&record.plate);
        out.push(',');
        out.push_str(if record.authorized {
            TRUE_LITERAL
        } else {
            FALSE_LITERAL
        });
        out.push_str("\r\n");
    }
    out
}

fn split_row(line: &str) -> Vec<String> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_first_rows() -> Result<()> {
        let raw = "plate,authorized\r\n1234ABC,True\r\n5678XYZ,False\r\n";
        let records = parse_csv(raw)?;
        assert_eq!(
            records,
            vec![
                PlateRecord::new("1234ABC", true),
                PlateRecord::new("5678XYZ", false),
            ]
        );
        Ok(())
    }

    #[test]
    fn parse_normalizes_and_dedups_legacy_rows() -> Result<()> {
        let raw = "authorized,plate\nTrue,\"12 34-abc\"\nFalse,1234ABC\n\nfalse,0000AAA\n";
        let records = parse_csv(raw)?;
        assert_eq!(
            records,
            vec![
                PlateRecord::new("1234ABC", true),
                PlateRecord::new("0000AAA", false),
            ]
        );
        Ok(())
    }

    #[test]
    fn parse_rejects_missing_columns() {
        assert!(parse_csv("number,flag\n1,2\n").is_err());
    }

    #[test]
    fn parse_empty_file_is_empty_registry() -> Result<()> {
        assert!(parse_csv("")?.is_empty());
        assert!(parse_csv("plate,authorized\r\n")?.is_empty());
        Ok(())
    }

    #[test]
    fn render_always_writes_header() {
        assert_eq!(render_csv(&[]), "plate,authorized\r\n");
        assert_eq!(
            render_csv(&[PlateRecord::new("1234ABC", true)]),
            "plate,authorized\r\n1234ABC,True\r\n"
        );
    }
}
