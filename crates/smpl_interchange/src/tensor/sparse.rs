use ndarray as nd;
use smpl_utils::array::densify_triplets;
use strum_macros::Display;

/// Storage layouts of the legacy scipy sparse matrices
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SparseFormat {
    Csc,
    Csr,
    Coo,
}
impl SparseFormat {
    /// Maps a scipy class name (``csc_matrix``, ``csr_array``, ...) to its format
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "csc_matrix" | "csc_array" => Some(Self::Csc),
            "csr_matrix" | "csr_array" => Some(Self::Csr),
            "coo_matrix" | "coo_array" => Some(Self::Coo),
            _ => None,
        }
    }
}

/// A sparse matrix kept as (row, col, value) triplets. Triplets may repeat a
/// position, in which case the values add up on densification
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix {
    nr_rows: usize,
    nr_cols: usize,
    triplets: Vec<(usize, usize, f64)>,
}
impl SparseMatrix {
    pub fn new(nr_rows: usize, nr_cols: usize, triplets: Vec<(usize, usize, f64)>) -> Result<Self, String> {
        if let Some(&(r, c, _)) = triplets.iter().find(|(r, c, _)| *r >= nr_rows || *c >= nr_cols) {
            return Err(format!("entry ({r}, {c}) lies outside of a {nr_rows}x{nr_cols} matrix"));
        }
        Ok(Self { nr_rows, nr_cols, triplets })
    }

    /// Builds from the compressed column (csc) or compressed row (csr)
    /// representation. For csc ``indptr`` runs over columns and ``indices``
    /// holds row numbers, csr is the transpose of that.
    pub fn from_compressed(format: SparseFormat, shape: (usize, usize), data: &[f64], indices: &[i64], indptr: &[i64]) -> Result<Self, String> {
        let (nr_rows, nr_cols) = shape;
        let nr_major = match format {
            SparseFormat::Csc => nr_cols,
            SparseFormat::Csr => nr_rows,
            SparseFormat::Coo => return Err("coo matrices are not compressed".to_string()),
        };
        if indptr.len() != nr_major + 1 {
            return Err(format!("{format} indptr has {} entries, expected {}", indptr.len(), nr_major + 1));
        }
        if data.len() != indices.len() {
            return Err(format!("{format} has {} values but {} indices", data.len(), indices.len()));
        }
        let mut triplets = Vec::with_capacity(data.len());
        for (major, bounds) in indptr.windows(2).enumerate() {
            let start = to_index(bounds[0])?;
            let end = to_index(bounds[1])?;
            if start > end || end > data.len() {
                return Err(format!("{format} indptr is not monotonic within [0, {}]", data.len()));
            }
            for k in start..end {
                let minor = to_index(indices[k])?;
                let (r, c) = match format {
                    SparseFormat::Csc => (minor, major),
                    _ => (major, minor),
                };
                triplets.push((r, c, data[k]));
            }
        }
        Self::new(nr_rows, nr_cols, triplets)
    }

    pub fn from_coo(shape: (usize, usize), rows: &[i64], cols: &[i64], data: &[f64]) -> Result<Self, String> {
        if rows.len() != data.len() || cols.len() != data.len() {
            return Err(format!("coo has {} values, {} rows and {} cols", data.len(), rows.len(), cols.len()));
        }
        let triplets = rows
            .iter()
            .zip(cols)
            .zip(data)
            .map(|((&r, &c), &v)| Ok((to_index(r)?, to_index(c)?, v)))
            .collect::<Result<Vec<_>, String>>()?;
        Self::new(shape.0, shape.1, triplets)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nr_rows, self.nr_cols)
    }
    pub fn nnz(&self) -> usize {
        self.triplets.len()
    }
    pub fn triplets(&self) -> &[(usize, usize, f64)] {
        &self.triplets
    }
    pub fn to_dense(&self) -> nd::Array2<f64> {
        densify_triplets(self.nr_rows, self.nr_cols, &self.triplets)
    }
}

fn to_index(v: i64) -> Result<usize, String> {
    usize::try_from(v).map_err(|_| format!("negative sparse index {v}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn csc_and_csr_agree() {
        // [[1, 0, 2], [0, 3, 0]]
        let csc = SparseMatrix::from_compressed(SparseFormat::Csc, (2, 3), &[1.0, 3.0, 2.0], &[0, 1, 0], &[0, 1, 2, 3]).unwrap();
        let csr = SparseMatrix::from_compressed(SparseFormat::Csr, (2, 3), &[1.0, 2.0, 3.0], &[0, 2, 1], &[0, 2, 3]).unwrap();
        assert_eq!(csc.to_dense(), array![[1.0, 0.0, 2.0], [0.0, 3.0, 0.0]]);
        assert_eq!(csc.to_dense(), csr.to_dense());
        assert_eq!(csc.nnz(), 3);
    }

    #[test]
    fn coo_duplicates_are_summed() {
        let coo = SparseMatrix::from_coo((1, 2), &[0, 0], &[1, 1], &[0.25, 0.5]).unwrap();
        assert_eq!(coo.to_dense(), array![[0.0, 0.75]]);
    }

    #[test]
    fn out_of_bounds_entries_are_rejected() {
        assert!(SparseMatrix::from_compressed(SparseFormat::Csc, (2, 1), &[1.0], &[5], &[0, 1]).is_err());
        assert!(SparseMatrix::from_compressed(SparseFormat::Csc, (2, 2), &[1.0], &[0], &[0, 1]).is_err());
    }
}
