use std::collections::VecDeque;

use shardcopy_common::datum::Datum;
use shardcopy_common::error::CopyResult;

/// One decoded input row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// One value per copied column; `Datum::Null` marks a null.
    pub values: Vec<Datum>,
    /// Original serialized form of the row, without its record terminator.
    pub line: Vec<u8>,
}

impl SourceRow {
    pub fn new(values: Vec<Datum>, line: impl Into<Vec<u8>>) -> Self {
        Self {
            values,
            line: line.into(),
        }
    }
}

/// Lazy, finite, non-restartable stream of input rows.
///
/// `Ok(None)` is the end-of-data signal. A decode failure is returned as an
/// error and ends the operation.
pub trait RowSource: Send {
    fn next_row(&mut self) -> CopyResult<Option<SourceRow>>;
}

/// In-memory row source.
#[derive(Debug, Default)]
pub struct VecRowSource {
    rows: VecDeque<SourceRow>,
}

impl VecRowSource {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self { rows: rows.into() }
    }

    /// Build rows from values, rendering each line tab-separated with `\N`
    /// for nulls (PostgreSQL text format).
    pub fn from_values(rows: Vec<Vec<Datum>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|values| {
                let line = values
                    .iter()
                    .map(|v| match v {
                        Datum::Null => "\\N".to_string(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\t");
                SourceRow::new(values, line)
            })
            .collect();
        Self { rows }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowSource for VecRowSource {
    fn next_row(&mut self) -> CopyResult<Option<SourceRow>> {
        Ok(self.rows.pop_front())
    }
}
