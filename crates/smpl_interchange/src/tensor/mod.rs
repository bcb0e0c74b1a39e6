pub mod dense;
pub mod extract;
pub mod sparse;

pub use dense::{ArrayData, ByteOrder, DType, DenseArray};
pub use extract::{extract, AsDenseArray, ExtractionRule, ATTRIBUTE_PRIORITY};
pub use sparse::{SparseFormat, SparseMatrix};
