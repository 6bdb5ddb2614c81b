use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_DATA_METADATA: &str = "generated/data-metadata.csv";
pub const DEFAULT_DIFF_STATS: &str = "generated/image_diff_stats.txt";
const DIFF_THRESHOLD: f64 = 0.03;
const MEGABYTE: f64 = 1024.0 * 1024.0;

#[derive(Debug, Deserialize)]
struct MetadataRow {
    filename: String,
    bytes: u64,
}

/// Megabytes per immediate parent directory, in first-seen order.
pub fn summarize_data(csv_content: &str) -> Result<Vec<(String, f64)>> {
    let mut reader = csv::Reader::from_reader(csv_content.as_bytes());
    let mut totals: Vec<(String, f64)> = Vec::new();
    for row in reader.deserialize::<MetadataRow>() {
        let row = row.context("failed to parse data metadata row")?;
        let parts = row.filename.split('/').collect::<Vec<_>>();
        if parts.len() < 2 {
            bail!("filename {} has no parent directory", row.filename);
        }
        let directory = parts[parts.len() - 2];
        let megabytes = row.bytes as f64 / MEGABYTE;
        match totals.iter_mut().find(|(name, _)| name == directory) {
            Some((_, total)) => *total += megabytes,
            None => totals.push((directory.to_string(), megabytes)),
        }
    }
    Ok(totals)
}

pub fn render_data_summary(totals: &[(String, f64)]) -> String {
    let mut out = String::from("Summary of data by highest directory level:\n");
    for (directory, megabytes) in totals {
        out.push_str(&format!("{directory}: {megabytes:.2} MB\n"));
    }
    out
}

pub fn summarize_data_file(path: &Path) -> Result<Vec<(String, f64)>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    summarize_data(&content)
}

/// `name: value` pairs after the leading date line. A repeated name keeps its
/// first position and takes the latest value.
pub fn parse_diff_stats(content: &str) -> Result<Vec<(String, f64)>> {
    let pattern = Regex::new(r"^(.+):\s+(\d+\.\d+)").context("invalid diff stats pattern")?;
    let mut stats: Vec<(String, f64)> = Vec::new();
    for line in content.lines().skip(1) {
        let Some(captures) = pattern.captures(line) else {
            continue;
        };
        let name = captures[1].to_string();
        let value = captures[2]
            .parse::<f64>()
            .with_context(|| format!("invalid difference value in {line}"))?;
        match stats.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => stats.push((name, value)),
        }
    }
    Ok(stats)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffSummary {
    pub total: usize,
    pub max: (String, f64),
    pub min: (String, f64),
    pub mean: f64,
    pub above_threshold: Vec<(String, f64)>,
}

pub fn summarize_diff_stats(stats: &[(String, f64)]) -> Option<DiffSummary> {
    let first = stats.first()?;
    let mut max = first;
    let mut min = first;
    for entry in stats {
        if entry.1 > max.1 {
            max = entry;
        }
        if entry.1 < min.1 {
            min = entry;
        }
    }
    let mean = stats.iter().map(|(_, value)| value).sum::<f64>() / stats.len() as f64;
    Some(DiffSummary {
        total: stats.len(),
        max: max.clone(),
        min: min.clone(),
        mean,
        above_threshold: stats
            .iter()
            .filter(|(_, value)| *value > DIFF_THRESHOLD)
            .cloned()
            .collect(),
    })
}

/// Shortest round-trip digits in Python `repr` layout: a fractional part is always shown,
/// and exponents below -4 or from 16 up switch to `1e-05` / `1e+16` notation.
fn float_text(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent = exponent.parse::<i32>().unwrap_or(0);
    if value != 0.0 && !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs());
    }
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub fn render_diff_summary(summary: Option<&DiffSummary>, generated_at: NaiveDateTime) -> String {
    let Some(summary) = summary else {
        return "No valid statistics found.\n".to_string();
    };
    let mut out = format!(
        "Summary of image differences (generated on {}):\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    );
    out.push_str(&format!("- Total files: {}\n", summary.total));
    out.push_str(&format!(
        "- Maximum difference: {} with value {}\n",
        summary.max.0,
        float_text(summary.max.1)
    ));
    out.push_str(&format!(
        "- Minimum difference: {} with value {}\n",
        summary.min.0,
        float_text(summary.min.1)
    ));
    out.push_str(&format!("- Mean difference: {}\n", float_text(summary.mean)));
    if summary.above_threshold.is_empty() {
        out.push_str("- No files above 3% threshold.\n");
    } else {
        out.push_str("- Files above 3% threshold:\n");
        for (name, value) in &summary.above_threshold {
            out.push_str(&format!("  - {name}: {}\n", float_text(*value)));
        }
    }
    out
}

pub fn parse_diff_stats_file(path: &Path) -> Result<Vec<(String, f64)>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_diff_stats(&content)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn data_summary_groups_by_parent_directory() {
        let csv = "filename,bytes\n./data/raw/a.dta,1048576\n./data/clean/b.dta,524288\n./data/raw/c.csv,1048576\n";
        let totals = summarize_data(csv).expect("summary");
        assert_eq!(
            render_data_summary(&totals),
            "Summary of data by highest directory level:\nraw: 2.00 MB\nclean: 0.50 MB\n"
        );
    }

    #[test]
    fn data_summary_rejects_bare_filenames() {
        assert!(summarize_data("filename,bytes\nreadme.txt,10\n").is_err());
    }

    #[test]
    fn diff_stats_skip_date_line_and_noise() {
        let content = "2024-05-01\nfig1.png: 0.01\nnot a stat\nfig2.png: 0.05\nfig3.png: 0.5\nfig1.png: 0.02\n";
        let stats = parse_diff_stats(content).expect("parse");
        assert_eq!(
            stats,
            vec![
                ("fig1.png".to_string(), 0.02),
                ("fig2.png".to_string(), 0.05),
                ("fig3.png".to_string(), 0.5),
            ]
        );
    }

    #[test]
    fn diff_summary_reports_extremes_and_threshold() {
        let stats = vec![
            ("a.png".to_string(), 0.01),
            ("b.png".to_string(), 0.05),
            ("c.png".to_string(), 1.0),
        ];
        let summary = summarize_diff_stats(&stats).expect("summary");
        let generated_at = NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_opt(9, 30, 0))
            .expect("timestamp");
        let text = render_diff_summary(Some(&summary), generated_at);
        assert!(text.starts_with("Summary of image differences (generated on 2024-05-01 09:30:00):\n\n"));
        assert!(text.contains("- Total files: 3\n"));
        assert!(text.contains("- Maximum difference: c.png with value 1.0\n"));
        assert!(text.contains("- Minimum difference: a.png with value 0.01\n"));
        assert!(text.contains("- Files above 3% threshold:\n  - b.png: 0.05\n  - c.png: 1.0\n"));
    }

    #[test]
    fn empty_stats_say_so() {
        let generated_at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("timestamp");
        assert_eq!(summarize_diff_stats(&[]), None);
        assert_eq!(render_diff_summary(None, generated_at), "No valid statistics found.\n");
    }

    #[test]
    fn float_text_matches_python_repr() {
        assert_eq!(float_text(0.25), "0.25");
        assert_eq!(float_text(3.0), "3.0");
        assert_eq!(float_text(0.0), "0.0");
        assert_eq!(float_text(0.0001), "0.0001");
        assert_eq!(float_text(0.00001), "1e-05");
        assert_eq!(float_text(0.000015), "1.5e-05");
        assert_eq!(float_text(-0.00001), "-1e-05");
        assert_eq!(float_text(1e15), "1000000000000000.0");
        assert_eq!(float_text(1e16), "1e+16");
        assert_eq!(float_text(1.5e300), "1.5e+300");
        assert_eq!(float_text(f64::NAN), "nan");
    }
}
