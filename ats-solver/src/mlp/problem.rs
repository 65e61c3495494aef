use rustc_hash::FxHashMap;
use thiserror::Error;

/// Handle of a column (variable) in a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnId(usize);

impl ColumnId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Handle of a row (constraint) in a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(usize);

impl RowId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProblemError {
    #[error("entry ({row}, {column}) set twice")]
    DuplicateEntry { row: String, column: String },
    #[error("no entry ({row}, {column})")]
    MissingEntry { row: String, column: String },
    #[error("invalid row handle {0}")]
    InvalidRow(usize),
    #[error("invalid column handle {0}")]
    InvalidColumn(usize),
    #[error("coefficient for ({row}, {column}) is not finite: {value}")]
    NotFinite { row: String, column: String, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Continuous,
    Binary,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub lower: f64,
    pub upper: Option<f64>,
    pub objective: f64,
}

/// Bounds on the activity of a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowBound {
    /// `activity <= value`
    Upper(f64),
    /// `activity >= value`
    Lower(f64),
    /// `activity == value`
    Fixed(f64),
    /// `lower <= activity <= upper`
    Range(f64, f64),
}

impl RowBound {
    /// Whether `value` satisfies the bound, with tolerance `tol`.
    pub fn contains(&self, value: f64, tol: f64) -> bool {
        match *self {
            Self::Upper(u) => value <= u + tol,
            Self::Lower(l) => value >= l - tol,
            Self::Fixed(v) => (value - v).abs() <= tol,
            Self::Range(l, u) => value >= l - tol && value <= u + tol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Row {
    pub name: String,
    pub bound: RowBound,
    pub entries: Vec<(ColumnId, f64)>,
}

/// A linear maximization problem with sparse constraint rows.
///
/// Rows and columns are allocated through handles; coefficients are appended through
/// [`Problem::set_value`], which refuses to set the same cell twice, and patched through
/// [`Problem::update_value`].
#[derive(Debug, Clone, Default)]
pub struct Problem {
    columns: Vec<Column>,
    rows: Vec<Row>,
    /// Position of each cell within its row's entries.
    cells: FxHashMap<(RowId, ColumnId), usize>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        kind: ColumnKind,
        lower: f64,
        upper: Option<f64>,
        objective: f64,
    ) -> ColumnId {
        let id = ColumnId(self.columns.len());
        self.columns.push(Column { name: name.into(), kind, lower, upper, objective });
        id
    }

    pub fn add_row(&mut self, name: impl Into<String>, bound: RowBound) -> RowId {
        let id = RowId(self.rows.len());
        self.rows.push(Row { name: name.into(), bound, entries: Vec::new() });
        id
    }

    /// Sets a new coefficient. Fails if the cell already holds a value.
    pub fn set_value(&mut self, row: RowId, column: ColumnId, value: f64) -> Result<(), ProblemError> {
        self.check(row, column, value)?;
        if self.cells.contains_key(&(row, column)) {
            return Err(ProblemError::DuplicateEntry {
                row: self.rows[row.0].name.clone(),
                column: self.columns[column.0].name.clone(),
            });
        }

        let entries = &mut self.rows[row.0].entries;
        self.cells.insert((row, column), entries.len());
        entries.push((column, value));
        Ok(())
    }

    /// Replaces an existing coefficient. Returns whether the value actually changed.
    pub fn update_value(
        &mut self,
        row: RowId,
        column: ColumnId,
        value: f64,
    ) -> Result<bool, ProblemError> {
        self.check(row, column, value)?;
        let Some(&pos) = self.cells.get(&(row, column)) else {
            return Err(ProblemError::MissingEntry {
                row: self.rows[row.0].name.clone(),
                column: self.columns[column.0].name.clone(),
            });
        };

        let cell = &mut self.rows[row.0].entries[pos].1;
        if *cell == value {
            return Ok(false);
        }
        *cell = value;
        Ok(true)
    }

    pub fn value(&self, row: RowId, column: ColumnId) -> Option<f64> {
        let pos = self.cells.get(&(row, column))?;
        Some(self.rows[row.0].entries[*pos].1)
    }

    fn check(&self, row: RowId, column: ColumnId, value: f64) -> Result<(), ProblemError> {
        let Some(r) = self.rows.get(row.0) else {
            return Err(ProblemError::InvalidRow(row.0));
        };
        let Some(c) = self.columns.get(column.0) else {
            return Err(ProblemError::InvalidColumn(column.0));
        };
        if !value.is_finite() {
            return Err(ProblemError::NotFinite {
                row: r.name.clone(),
                column: c.name.clone(),
                value,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[inline]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    #[inline]
    pub fn column(&self, id: ColumnId) -> &Column {
        &self.columns[id.0]
    }

    /// Number of non-zero cells.
    #[inline]
    pub fn elements(&self) -> usize {
        self.cells.len()
    }

    /// Objective value of `values`.
    pub fn objective_value(&self, values: &[f64]) -> f64 {
        self.columns.iter().zip(values).map(|(c, v)| c.objective * v).sum()
    }

    /// Row activities of `values`.
    pub fn activities(&self, values: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|r| r.entries.iter().map(|(c, v)| v * values[c.0]).sum())
            .collect()
    }
}
