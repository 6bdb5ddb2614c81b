use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

pub const NOT_UTF8_MESSAGE: &str = "Output of parser is not UTF-8 encoded";
pub const NO_DATA_MESSAGE: &str = "No data.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    Table { rows: usize },
    NotUtf8,
    NoData,
}

/// `data.csv` -> `data.md`; paths without `.csv` get an `.md` extension.
pub fn default_output_path(input: &Path) -> PathBuf {
    let text = input.to_string_lossy();
    if text.contains(".csv") {
        PathBuf::from(text.replace(".csv", ".md"))
    } else {
        input.with_extension("md")
    }
}

/// Render CSV bytes as a Markdown table. Returns the table text and the outcome.
pub fn render(bytes: &[u8]) -> Result<(String, Conversion)> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) if !text.is_empty() => text,
        _ => return Ok((NOT_UTF8_MESSAGE.to_string(), Conversion::NotUtf8)),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .context("failed to read CSV header")?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("failed to parse CSV record")?;
        let mut cells = record.iter().take(headers.len()).map(ToString::to_string).collect::<Vec<_>>();
        while cells.len() < headers.len() {
            cells.push("None".to_string());
        }
        if record.len() > headers.len() {
            let extra = record
                .iter()
                .skip(headers.len())
                .map(|value| format!("'{value}'"))
                .collect::<Vec<_>>();
            cells.push(format!("[{}]", extra.join(", ")));
        }
        rows.push(cells);
    }
    if rows.is_empty() {
        return Ok((NO_DATA_MESSAGE.to_string(), Conversion::NoData));
    }

    let mut table = format!("| {} |\n", headers.join(" | "));
    table.push_str(&format!("| {} |\n", vec!["---"; headers.len()].join(" | ")));
    for row in &rows {
        table.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    Ok((table, Conversion::Table { rows: rows.len() }))
}

pub fn convert_file(input: &Path, output: &Path) -> Result<Conversion> {
    let bytes = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let (markdown, outcome) = render(&bytes)?;
    match outcome {
        Conversion::NotUtf8 => warn!(file = %input.display(), "CSV file is not UTF-8 encoded"),
        Conversion::NoData => warn!(file = %input.display(), "CSV file is empty"),
        Conversion::Table { rows } => info!(rows, output = %output.display(), "wrote Markdown table"),
    }
    fs::write(output, markdown).with_context(|| format!("failed to write {}", output.display()))?;
    Ok(outcome)
}
