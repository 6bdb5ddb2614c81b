use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::Value;

/// Outcome of checking that a notebook's code cells ran top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    NotFound { path: String },
    InvalidJson { path: String },
    Unexpected { message: String },
    NoCode { name: String },
    NotRun { name: String, cell: usize },
    OutOfOrder { name: String, cell: usize, expected: u64, found: String },
    Sequential { name: String, cells: usize },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::NoCode { .. } | Self::Sequential { .. })
    }

    pub fn to_markdown(&self) -> String {
        match self {
            Self::NotFound { path } => format!("### ❌ Error\n\n> **File not found:** `{path}`"),
            Self::InvalidJson { path } => format!(
                "### ❌ Error\n\n> Could not parse JSON from `{path}`. The file may be corrupted."
            ),
            Self::Unexpected { message } => {
                format!("### ❌ An unexpected error occurred\n\n> {message}")
            }
            Self::NoCode { name } => format!(
                "### ✅ Notebook Contains No Code\n\n> The notebook `{name}` has no code cells to check."
            ),
            Self::NotRun { name, cell } => format!(
                "### ⚠️ Warning: Cell Not Run\n\n> Code cell **{cell}** in `{name}` was not executed."
            ),
            Self::OutOfOrder {
                name,
                cell,
                expected,
                found,
            } => format!(
                "### ❌ Out of Order Execution\n\n> Mismatch found in `{name}` at code cell **{cell}**.\n> - **Expected execution count:** `{expected}`\n> - **Found execution count:** `{found}`"
            ),
            Self::Sequential { name, cells } => format!(
                "### ✅ Success!\n\n> All **{cells}** code cells in `{name}` were run in sequential order."
            ),
        }
    }
}

pub fn check_notebook(path: &Path) -> Verdict {
    let shown = path.display().to_string();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Verdict::NotFound { path: shown };
        }
        Err(error) => {
            return Verdict::Unexpected {
                message: error.to_string(),
            };
        }
    };
    let Ok(notebook) = serde_json::from_str::<Value>(&content) else {
        return Verdict::InvalidJson { path: shown };
    };
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(shown);
    check_cells(&notebook, name)
}

pub fn check_cells(notebook: &Value, name: String) -> Verdict {
    let Some(cells) = notebook.get("cells").and_then(Value::as_array) else {
        return Verdict::Unexpected {
            message: "notebook has no 'cells' list".to_string(),
        };
    };
    let code_cells = cells
        .iter()
        .filter(|cell| cell.get("cell_type").and_then(Value::as_str) == Some("code"))
        .collect::<Vec<_>>();
    if code_cells.is_empty() {
        return Verdict::NoCode { name };
    }

    let mut expected = 1u64;
    for (index, cell) in code_cells.iter().enumerate() {
        let cell_number = index + 1;
        let count = match cell.get("execution_count") {
            None | Some(Value::Null) => {
                return Verdict::NotRun {
                    name,
                    cell: cell_number,
                };
            }
            Some(count) => count,
        };
        let matches = count.as_u64() == Some(expected)
            || count.as_f64() == Some(expected as f64);
        if !matches {
            return Verdict::OutOfOrder {
                name,
                cell: cell_number,
                expected,
                found: count.to_string(),
            };
        }
        expected += 1;
    }
    Verdict::Sequential {
        name,
        cells: code_cells.len(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn code(count: Value) -> Value {
        json!({"cell_type": "code", "execution_count": count, "source": []})
    }

    #[test]
    fn sequential_notebook_passes() {
        let notebook = json!({"cells": [
            code(json!(1)),
            {"cell_type": "markdown", "source": ["# hi"]},
            code(json!(2)),
        ]});
        let verdict = check_cells(&notebook, "analysis.ipynb".to_string());
        assert!(verdict.is_success());
        assert_eq!(
            verdict.to_markdown(),
            "### ✅ Success!\n\n> All **2** code cells in `analysis.ipynb` were run in sequential order."
        );
    }

    #[test]
    fn first_unexecuted_cell_is_reported() {
        let notebook = json!({"cells": [code(json!(1)), code(Value::Null), code(json!(3))]});
        assert_eq!(
            check_cells(&notebook, "nb.ipynb".to_string()),
            Verdict::NotRun {
                name: "nb.ipynb".to_string(),
                cell: 2
            }
        );
    }

    #[test]
    fn out_of_order_reports_expected_and_found() {
        let notebook = json!({"cells": [code(json!(1)), code(json!(5))]});
        let verdict = check_cells(&notebook, "nb.ipynb".to_string());
        assert!(!verdict.is_success());
        assert_eq!(
            verdict.to_markdown(),
            "### ❌ Out of Order Execution\n\n> Mismatch found in `nb.ipynb` at code cell **2**.\n> - **Expected execution count:** `2`\n> - **Found execution count:** `5`"
        );
    }

    #[test]
    fn notebook_without_code_is_fine() {
        let notebook = json!({"cells": [{"cell_type": "markdown", "source": []}]});
        assert!(matches!(
            check_cells(&notebook, "nb.ipynb".to_string()),
            Verdict::NoCode { .. }
        ));
    }

    #[test]
    fn file_errors_become_verdicts() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("missing.ipynb");
        assert!(matches!(check_notebook(&missing), Verdict::NotFound { .. }));

        let broken = temp.path().join("broken.ipynb");
        fs::write(&broken, "{not json").expect("write");
        let verdict = check_notebook(&broken);
        assert!(matches!(verdict, Verdict::InvalidJson { .. }));
        assert!(verdict.to_markdown().contains("The file may be corrupted."));
    }
}
