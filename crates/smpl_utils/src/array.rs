use ndarray as nd;
use num_traits::Zero;
use std::ops::AddAssign;

//there is currently no scatter_add in ndarray, this follows the scatter/gather workaround from
//https://github.com/rust-ndarray/ndarray/issues/526#issuecomment-434917877
pub trait ScatterAdd2D<T: Copy + Zero + AddAssign> {
    /// perform the equivalent from python of np.add.at(dst, (indices_rows, indices_cols), src) where
    /// self is the src. Repeated (row, col) pairs accumulate instead of overwriting.
    ///
    /// # Panics
    /// Will panic if an index pair falls outside of ``dst``
    fn scatter_add(&self, indices_rows: &[usize], indices_cols: &[usize], dst: &mut nd::Array2<T>);
}
impl<T: Copy + Zero + AddAssign> ScatterAdd2D<T> for nd::Array1<T> {
    fn scatter_add(&self, indices_rows: &[usize], indices_cols: &[usize], dst: &mut nd::Array2<T>) {
        for ((&val, &row), &col) in self.iter().zip(indices_rows).zip(indices_cols) {
            dst[(row, col)] += val;
        }
    }
}

/// Densify a list of (row, col, value) triplets into a zero initialized matrix
/// of shape ``(nr_rows, nr_cols)``
///
/// # Panics
/// Will panic if a triplet falls outside of the declared shape
pub fn densify_triplets<T: Copy + Zero + AddAssign>(nr_rows: usize, nr_cols: usize, triplets: &[(usize, usize, T)]) -> nd::Array2<T> {
    let rows: Vec<usize> = triplets.iter().map(|t| t.0).collect();
    let cols: Vec<usize> = triplets.iter().map(|t| t.1).collect();
    let vals: nd::Array1<T> = triplets.iter().map(|t| t.2).collect();
    let mut dense = nd::Array2::<T>::zeros((nr_rows, nr_cols));
    vals.scatter_add(&rows, &cols, &mut dense);
    dense
}

pub trait RowMajor<T: Copy> {
    /// Flattens in logical row-major (C) order regardless of the memory layout
    /// of the array, so fortran ordered arrays come out the same as c ordered
    /// ones.
    fn to_row_major_vec(&self) -> Vec<T>;
}
impl<T: Copy, S: nd::Data<Elem = T>, D: nd::Dimension> RowMajor<T> for nd::ArrayBase<S, D> {
    fn to_row_major_vec(&self) -> Vec<T> {
        self.iter().copied().collect()
    }
}
