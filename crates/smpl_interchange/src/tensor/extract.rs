use super::dense::DenseArray;
use crate::{
    error::{Result, SmplError},
    pickle::{RawValue, Stub},
};
use log::debug;
use strum_macros::{Display, EnumIter};

/// Attribute names under which legacy wrappers keep their payload, most
/// specific first
pub const ATTRIBUTE_PRIORITY: [&str; 7] = ["x", "r", "_value", "data", "array", "v", "arr"];

/// One way of finding the dense array behind a raw value. Rules are tried in
/// ``ExtractionRule::ORDER`` and the first one that matches decides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionRule {
    /// already a dense array, copied
    Dense,
    /// a sparse matrix, scatter-added into zeros of its declared shape
    DensifySparse,
    /// a stub constructed with an array as positional or keyword argument
    ConstructorArgument,
    /// a stub with one of ``ATTRIBUTE_PRIORITY`` among its attributes
    AttributePriority,
}
impl ExtractionRule {
    pub const ORDER: [Self; 4] = [Self::Dense, Self::DensifySparse, Self::ConstructorArgument, Self::AttributePriority];

    /// ``None`` when the rule does not apply to ``value``
    pub fn apply(self, value: &RawValue) -> Option<Result<DenseArray>> {
        match (self, value) {
            (Self::Dense, RawValue::DenseArray(array)) => Some(Ok(array.clone())),
            (Self::DensifySparse, RawValue::SparseMatrix(matrix)) => Some(Ok(DenseArray::from(matrix.to_dense()))),
            (Self::ConstructorArgument, RawValue::Stub(stub)) => constructor_array(stub).map(|inner| extract_wrapped(stub, inner)),
            (Self::AttributePriority, RawValue::Stub(stub)) => ATTRIBUTE_PRIORITY
                .iter()
                .find_map(|key| stub.attribute(key))
                .map(|inner| extract_wrapped(stub, inner)),
            _ => None,
        }
    }
}

/// Extracts the payload of ``stub``, reporting failures against the stub's own
/// declared type followed by the payload's
fn extract_wrapped(stub: &Stub, inner: &RawValue) -> Result<DenseArray> {
    extract(inner).map_err(|err| match err {
        SmplError::ArrayExtraction { field: None, type_name } => SmplError::ArrayExtraction {
            field: None,
            type_name: format!("{} wrapping {type_name}", stub.type_name),
        },
        other => other,
    })
}

fn constructor_array(stub: &Stub) -> Option<&RawValue> {
    stub.args
        .iter()
        .find(|arg| arg.is_array_like())
        .or_else(|| stub.kwargs.values().find(|arg| arg.is_array_like()))
}

/// Recovers the dense numeric array behind ``value``.
///
/// # Errors
/// ``ArrayExtraction`` naming the declared type of the value no rule matched.
/// The field is left unset for the caller to fill in.
pub fn extract(value: &RawValue) -> Result<DenseArray> {
    for rule in ExtractionRule::ORDER {
        if let Some(result) = rule.apply(value) {
            debug!("{} matched by rule {rule}", value.type_name());
            return result;
        }
    }
    Err(SmplError::ArrayExtraction {
        field: None,
        type_name: value.type_name(),
    })
}

/// Capability of holding a dense numeric array, directly or behind a wrapper
pub trait AsDenseArray {
    /// # Errors
    /// see [`extract`]
    fn as_dense_array(&self) -> Result<DenseArray>;
}
impl AsDenseArray for RawValue {
    fn as_dense_array(&self) -> Result<DenseArray> {
        extract(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pickle::{QualifiedName, Scalar},
        tensor::SparseMatrix,
    };
    use ndarray as nd;
    use std::collections::BTreeMap;
    use strum::IntoEnumIterator;

    fn dense() -> DenseArray {
        DenseArray::from(nd::array![[1.0, 2.0], [3.0, 4.0]])
    }

    fn ch() -> Stub {
        Stub::new(QualifiedName::new("chumpy.ch", "Ch"))
    }

    #[test]
    fn order_covers_every_rule() {
        assert_eq!(ExtractionRule::ORDER.to_vec(), ExtractionRule::iter().collect::<Vec<_>>());
    }

    #[test]
    fn dense_is_copied_unchanged() {
        let value = RawValue::from(dense());
        assert_eq!(extract(&value).unwrap(), dense());
        assert_eq!(value.as_dense_array().unwrap(), extract(&value).unwrap());
    }

    #[test]
    fn sparse_is_densified_deterministically() {
        let sparse = SparseMatrix::new(2, 3, vec![(0, 1, 0.5), (1, 2, 2.0), (0, 1, 0.25)]).unwrap();
        let value = RawValue::from(sparse);
        let first = extract(&value).unwrap();
        assert_eq!(first.shape(), &[2, 3]);
        assert_eq!(first.to_f64().into_dimensionality::<nd::Ix2>().unwrap(), nd::array![[0.0, 0.75, 0.0], [0.0, 0.0, 2.0]]);
        assert_eq!(extract(&value).unwrap(), first);
    }

    #[test]
    fn constructor_argument_wins_over_attributes() {
        let mut stub = ch();
        stub.construct(vec![RawValue::Scalar(Scalar::Int(0)), RawValue::from(dense())], BTreeMap::new());
        stub.attributes.insert("x".into(), RawValue::from(DenseArray::from(nd::Array2::<f64>::zeros((1, 1)))));
        assert_eq!(extract(&RawValue::from(stub)).unwrap(), dense());

        let mut by_keyword = ch();
        let mut kwargs = BTreeMap::new();
        kwargs.insert("value".to_string(), RawValue::from(dense()));
        by_keyword.construct(Vec::new(), kwargs);
        assert_eq!(extract(&RawValue::from(by_keyword)).unwrap(), dense());
    }

    #[test]
    fn attribute_priority_and_nesting() {
        let mut inner = ch();
        inner.attributes.insert("_value".into(), RawValue::from(dense()));
        let mut outer = ch();
        outer.attributes.insert("arr".into(), RawValue::from(DenseArray::from(nd::Array2::<f64>::zeros((1, 1)))));
        outer.attributes.insert("r".into(), RawValue::from(inner));
        assert_eq!(extract(&RawValue::from(outer)).unwrap(), dense());
    }

    #[test]
    fn unresolvable_value_names_its_type() {
        let mut stub = ch();
        stub.attributes.insert("unrelated".into(), RawValue::from(dense()));
        let err = extract(&RawValue::from(stub)).unwrap_err();
        assert!(matches!(err, SmplError::ArrayExtraction { field: None, ref type_name } if type_name == "chumpy.ch.Ch"));
        let err = extract(&RawValue::Scalar(Scalar::Float(1.0))).unwrap_err().in_field("weights");
        assert_eq!(err.field(), Some("weights"));
    }

    #[test]
    fn non_array_payload_names_the_wrapper() {
        let mut stub = ch();
        stub.attributes.insert("x".into(), RawValue::Scalar(Scalar::Int(3)));
        stub.attributes.insert("arr".into(), RawValue::from(dense()));
        let scalar_name = RawValue::Scalar(Scalar::Int(3)).type_name();
        let err = extract(&RawValue::from(stub)).unwrap_err();
        assert!(
            matches!(err, SmplError::ArrayExtraction { field: None, ref type_name } if *type_name == format!("chumpy.ch.Ch wrapping {scalar_name}"))
        );

        let mut inner = ch();
        inner.attributes.insert("x".into(), RawValue::Scalar(Scalar::Int(3)));
        let mut outer = Stub::new(QualifiedName::new("chumpy.reordering", "Select"));
        outer.attributes.insert("r".into(), RawValue::from(inner));
        let err = extract(&RawValue::from(outer)).unwrap_err().in_field("weights");
        assert!(matches!(err, SmplError::ArrayExtraction { ref type_name, .. } if type_name.starts_with("chumpy.reordering.Select wrapping chumpy.ch.Ch")));
        assert_eq!(err.field(), Some("weights"));
    }
}
