//! Aggregation of per-file outcomes and the final report table.

use std::{path::PathBuf, sync::Mutex};

use humansize::{format_size, BINARY};

/// The recorded result of one processed file.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub path: PathBuf,
    pub mime_type: String,
    pub original_size: u64,
    pub compressed_size: u64,
    /// The compressed result was not written back (see the skip policy).
    pub skipped: bool,
}

impl Outcome {
    /// Bytes saved by the compression. Zero for skipped files.
    pub fn saved(&self) -> u64 {
        if self.skipped {
            0
        } else {
            self.original_size.saturating_sub(self.compressed_size)
        }
    }

    /// Signed size change relative to the original, in percent.
    pub fn percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        (self.compressed_size as f64 - self.original_size as f64) / self.original_size as f64
            * 100.0
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Thread-safe accumulator of [`Outcome`]s in completion order.
///
/// Rendering happens strictly after all workers have finished, so a
/// mutex-guarded vector is all the synchronization this needs.
#[derive(Debug, Default)]
pub struct Summary {
    outcomes: Mutex<Vec<Outcome>>,
}

impl Summary {
    pub fn add(&self, outcome: Outcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the recorded outcomes, in completion order.
    pub fn snapshot(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Renders the fixed-column report table. Column widths are computed
    /// from the data.
    pub fn render_table(&self) -> String {
        let outcomes = self.snapshot();

        let header = ["File", "Type", "Original", "Compressed", "Saved"];
        let mut rows: Vec<[String; 5]> = Vec::with_capacity(outcomes.len() + 1);

        for outcome in &outcomes {
            let saved = if outcome.skipped {
                "skipped".to_string()
            } else {
                format!(
                    "-{} ({:+.2}%)",
                    format_size(outcome.saved(), BINARY),
                    outcome.percent()
                )
            };
            rows.push([
                outcome.file_name(),
                outcome.mime_type.clone(),
                format_size(outcome.original_size, BINARY),
                format_size(outcome.compressed_size, BINARY),
                saved,
            ]);
        }

        let replaced: Vec<&Outcome> = outcomes.iter().filter(|o| !o.skipped).collect();
        let totals = outcomes.len() >= 2 && !replaced.is_empty();
        if totals {
            let original: u64 = replaced.iter().map(|o| o.original_size).sum();
            let compressed: u64 = replaced.iter().map(|o| o.compressed_size).sum();
            let saved = original.saturating_sub(compressed);
            let percent = if original == 0 {
                0.0
            } else {
                (compressed as f64 - original as f64) / original as f64 * 100.0
            };
            rows.push([
                "Total".to_string(),
                String::new(),
                format_size(original, BINARY),
                format_size(compressed, BINARY),
                format!("-{} ({:+.2}%)", format_size(saved, BINARY), percent),
            ]);
        }

        let mut widths: Vec<usize> = header.iter().map(|cell| cell.len()).collect();
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let render_row = |cells: &[String; 5]| -> String {
            let line = cells
                .iter()
                .zip(widths.iter().copied())
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            line.trim_end().to_string()
        };

        let mut lines = Vec::with_capacity(rows.len() + 2);
        lines.push(render_row(&header.map(String::from)));
        for (index, row) in rows.iter().enumerate() {
            if totals && index == rows.len() - 1 {
                lines.push("-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));
            }
            lines.push(render_row(row));
        }
        lines.join("\n")
    }
}
