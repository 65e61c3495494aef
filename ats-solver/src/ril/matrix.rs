/// A dense matrix whose columns come in equally sized blocks.
///
/// Rows are actions, column blocks are the features of one address. Adding or removing an
/// address adds or removes a whole block in every row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockMatrix {
    block_len: usize,
    blocks: usize,
    rows: Vec<Vec<f64>>,
}

impl BlockMatrix {
    /// Creates a matrix with `rows` rows and no blocks.
    pub(crate) fn new(rows: usize, block_len: usize) -> Self {
        Self { block_len, blocks: 0, rows: vec![Vec::new(); rows] }
    }

    #[inline]
    pub(crate) fn rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub(crate) const fn width(&self) -> usize {
        self.blocks * self.block_len
    }

    #[cfg(test)]
    pub(crate) fn row(&self, row: usize) -> &[f64] {
        &self.rows[row]
    }

    #[inline]
    pub(crate) fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.rows[row]
    }

    /// Appends a block to every row, initialized by `init`.
    pub(crate) fn push_block(&mut self, mut init: impl FnMut() -> f64) {
        for row in &mut self.rows {
            row.extend((0..self.block_len).map(|_| init()));
        }
        self.blocks += 1;
    }

    /// Appends a row, initialized by `init`.
    pub(crate) fn push_row(&mut self, mut init: impl FnMut() -> f64) {
        let width = self.width();
        self.rows.push((0..width).map(|_| init()).collect());
    }

    pub(crate) fn remove_block(&mut self, block: usize) {
        if block >= self.blocks {
            return;
        }
        let start = block * self.block_len;
        for row in &mut self.rows {
            row.drain(start..start + self.block_len);
        }
        self.blocks -= 1;
    }

    pub(crate) fn remove_row(&mut self, row: usize) {
        if row < self.rows.len() {
            self.rows.remove(row);
        }
    }

    /// Dot product of `row` with `state`.
    #[inline]
    pub(crate) fn dot(&self, row: usize, state: &[f64]) -> f64 {
        self.rows[row].iter().zip(state).map(|(w, s)| w * s).sum()
    }

    pub(crate) fn scale(&mut self, factor: f64) {
        self.rows.iter_mut().flatten().for_each(|v| *v *= factor);
    }

    pub(crate) fn fill(&mut self, value: f64) {
        self.rows.iter_mut().flatten().for_each(|v| *v = value);
    }

    /// `self += factor · other`. Both matrices must have the same shape.
    pub(crate) fn add_scaled(&mut self, other: &Self, factor: f64) {
        for (row, other) in self.rows.iter_mut().zip(&other.rows) {
            for (v, o) in row.iter_mut().zip(other) {
                *v += factor * o;
            }
        }
    }
}
