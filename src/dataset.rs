use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const NAME_COLUMN: &str = "name";
const SCORE_COLUMN: &str = "score";

/// One row of the score table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    #[serde(default)]
    pub name: Option<String>,
    pub score: f64,
}

/// All rows of a score table, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub records: Vec<ScoreRecord>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Dataset> {
        let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
        Dataset::from_reader(file).with_context(|| format!("unable to parse {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Dataset> {
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut records = Vec::new();
        for (index, row) in reader.deserialize::<ScoreRecord>().enumerate() {
            records.push(row.with_context(|| format!("invalid data row {}", index + 1))?);
        }
        Ok(Dataset { records })
    }

    /// The `score` column in file order.
    pub fn scores(&self) -> Vec<f64> {
        self.records.iter().map(|record| record.score).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Appends `record` as a new row, following the column order of the existing
/// header. A missing file is created with a `name,score` header.
pub fn append_record(path: &Path, record: &ScoreRecord) -> Result<()> {
    if !path.exists() {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("unable to create {}", path.display()))?;
        writer.write_record([NAME_COLUMN, SCORE_COLUMN])?;
        writer.write_record(row_for(&[NAME_COLUMN, SCORE_COLUMN], record))?;
        writer.flush()?;
        return Ok(());
    }

    let headers = read_headers(path)?;
    if !headers.iter().any(|column| column == SCORE_COLUMN) {
        anyhow::bail!("{} has no `{}` column", path.display(), SCORE_COLUMN);
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("unable to open {} for appending", path.display()))?;
    if !ends_with_newline(&mut file)? {
        file.write_all(b"\n")?;
    }

    let columns = headers.iter().collect::<Vec<_>>();
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(row_for(&columns, record))?;
    writer.flush()?;
    Ok(())
}

/// Rewrites the file without rows whose `name` contains `pattern`.
/// Returns the number of removed rows.
pub fn remove_matching(path: &Path, pattern: &str) -> Result<usize> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("unable to open {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let name_index = headers.iter().position(|column| column.trim() == NAME_COLUMN);

    let mut kept = Vec::new();
    let mut removed = 0;
    for row in reader.records() {
        let row = row.with_context(|| format!("unable to read {}", path.display()))?;
        let matches = name_index
            .and_then(|index| row.get(index))
            .map_or(false, |name| name.contains(pattern));
        if matches {
            removed += 1;
        } else {
            kept.push(row);
        }
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("unable to rewrite {}", path.display()))?;
    writer.write_record(&headers)?;
    for row in &kept {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(removed)
}

fn read_headers(path: &Path) -> Result<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("unable to open {}", path.display()))?;
    let headers = reader.headers()?.iter().map(str::trim).collect();
    Ok(headers)
}

fn row_for(columns: &[&str], record: &ScoreRecord) -> Vec<String> {
    columns
        .iter()
        .map(|&column| match column {
            NAME_COLUMN => record.name.clone().unwrap_or_default(),
            SCORE_COLUMN => record.score.to_string(),
            _ => String::new(),
        })
        .collect()
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
