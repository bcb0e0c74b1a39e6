use crate::tensor::{DenseArray, SparseMatrix};
use std::{collections::BTreeMap, fmt};

/// A python type reference as it appears in the stream, e.g. ``chumpy.ch.Ch``
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub module: String,
    pub name: String,
}
impl QualifiedName {
    pub fn new(module: &str, name: &str) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
        }
    }
}
impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Type erased node of a deserialized object graph
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    DenseArray(DenseArray),
    SparseMatrix(SparseMatrix),
    Mapping(BTreeMap<String, RawValue>),
    Sequence(Vec<RawValue>),
    Scalar(Scalar),
    Stub(Stub),
}
impl RawValue {
    /// The python-side type this value was declared with, used in error messages
    pub fn type_name(&self) -> String {
        match self {
            Self::DenseArray(a) => format!("numpy.ndarray[{}]", a.dtype()),
            Self::SparseMatrix(_) => "scipy.sparse.spmatrix".to_string(),
            Self::Mapping(_) => "dict".to_string(),
            Self::Sequence(_) => "list".to_string(),
            Self::Scalar(s) => match s {
                Scalar::None => "NoneType",
                Scalar::Bool(_) => "bool",
                Scalar::Int(_) => "int",
                Scalar::Float(_) => "float",
                Scalar::Str(_) => "str",
                Scalar::Bytes(_) => "bytes",
            }
            .to_string(),
            Self::Stub(stub) => stub.type_name.to_string(),
        }
    }
    pub fn as_mapping(&self) -> Option<&BTreeMap<String, RawValue>> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }
    pub fn is_array_like(&self) -> bool {
        matches!(self, Self::DenseArray(_) | Self::SparseMatrix(_))
    }
}
impl From<DenseArray> for RawValue {
    fn from(arr: DenseArray) -> Self {
        Self::DenseArray(arr)
    }
}
impl From<SparseMatrix> for RawValue {
    fn from(m: SparseMatrix) -> Self {
        Self::SparseMatrix(m)
    }
}
impl From<Stub> for RawValue {
    fn from(stub: Stub) -> Self {
        Self::Stub(stub)
    }
}

/// Stand-in for an instance of a type that is not available at read time. It
/// keeps whatever it was constructed and restored with, and has no behaviour
/// of its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stub {
    pub type_name: QualifiedName,
    pub args: Vec<RawValue>,
    pub kwargs: BTreeMap<String, RawValue>,
    pub attributes: BTreeMap<String, RawValue>,
    /// restore state that was neither a dict nor a (dict, slots) pair
    pub state: Option<Box<RawValue>>,
}
impl Stub {
    pub fn new(type_name: QualifiedName) -> Self {
        Self {
            type_name,
            ..Default::default()
        }
    }

    /// Records constructor arguments. Never fails, whatever their shape.
    pub fn construct(&mut self, args: Vec<RawValue>, kwargs: BTreeMap<String, RawValue>) {
        self.args.extend(args);
        self.kwargs.extend(kwargs);
    }

    /// Records restore state the way ``object.__setstate__`` would: a dict
    /// lands in the attributes, a (dict, slots) pair is merged, anything else
    /// is kept verbatim
    pub fn set_state(&mut self, state: RawValue) {
        match state {
            RawValue::Mapping(attrs) => self.attributes.extend(attrs),
            RawValue::Sequence(items) if items.len() == 2 && items.iter().all(|i| matches!(i, RawValue::Mapping(_) | RawValue::Scalar(Scalar::None))) => {
                for item in items {
                    if let RawValue::Mapping(attrs) = item {
                        self.attributes.extend(attrs);
                    }
                }
            }
            other => self.state = Some(Box::new(other)),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&RawValue> {
        self.attributes.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_accepts_any_state_shape() {
        let mut stub = Stub::new(QualifiedName::new("chumpy.ch", "Ch"));
        stub.construct(vec![RawValue::Scalar(Scalar::Int(3))], BTreeMap::new());
        stub.set_state(RawValue::Scalar(Scalar::Str("opaque".into())));
        let mut slots = BTreeMap::new();
        slots.insert("x".to_string(), RawValue::Scalar(Scalar::Float(1.0)));
        stub.set_state(RawValue::Sequence(vec![RawValue::Scalar(Scalar::None), RawValue::Mapping(slots)]));

        assert_eq!(stub.args.len(), 1);
        assert_eq!(stub.attribute("x"), Some(&RawValue::Scalar(Scalar::Float(1.0))));
        assert_eq!(stub.state.as_deref(), Some(&RawValue::Scalar(Scalar::Str("opaque".into()))));
        assert_eq!(RawValue::Stub(stub).type_name(), "chumpy.ch.Ch");
    }
}
