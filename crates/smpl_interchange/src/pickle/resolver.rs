//! Three tier type resolution for ``GLOBAL`` references: native numeric types
//! pass through, registered legacy types become stubs, and the remaining
//! builtins resolve normally. Anything else is an error.
use super::{
    registry::{StubFactory, StubRegistry},
    value::QualifiedName,
};
use crate::{
    error::{Result, SmplError},
    tensor::SparseFormat,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Builtin {
    Object,
    Dict,
    List,
    Tuple,
    Set,
    Bytearray,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Callable {
    /// ``numpy.core.multiarray._reconstruct`` and ``numpy.ndarray`` itself
    ArrayReconstruct,
    /// ``numpy.core.numeric._frombuffer(buf, dtype, shape, order)``
    ArrayFromBuffer,
    Dtype,
    NumpyScalar,
    Sparse(SparseFormat),
    CopyRegReconstructor,
    NewObj,
    CodecsEncode,
    Builtin(Builtin),
    Stub(StubFactory),
}

/// A resolved ``GLOBAL``: the name it was referenced by and what calling it does
#[derive(Clone, Debug)]
pub(crate) struct Global {
    pub name: QualifiedName,
    pub callable: Callable,
}

fn native(module: &str, name: &str) -> Option<Callable> {
    let is_numpy_core = |suffix: &str| module == format!("numpy.core.{suffix}") || module == format!("numpy._core.{suffix}");
    match name {
        "_reconstruct" if is_numpy_core("multiarray") => Some(Callable::ArrayReconstruct),
        "scalar" if is_numpy_core("multiarray") => Some(Callable::NumpyScalar),
        "_frombuffer" if is_numpy_core("numeric") => Some(Callable::ArrayFromBuffer),
        "ndarray" if module == "numpy" => Some(Callable::ArrayReconstruct),
        "dtype" if module == "numpy" => Some(Callable::Dtype),
        _ if module == "scipy.sparse" || module.starts_with("scipy.sparse.") => SparseFormat::from_type_name(name).map(Callable::Sparse),
        _ => None,
    }
}

fn builtin(module: &str, name: &str) -> Option<Callable> {
    let callable = match (module, name) {
        ("__builtin__" | "builtins", "object") => Callable::Builtin(Builtin::Object),
        ("__builtin__" | "builtins", "dict") | ("collections", "OrderedDict") => Callable::Builtin(Builtin::Dict),
        ("__builtin__" | "builtins", "list") => Callable::Builtin(Builtin::List),
        ("__builtin__" | "builtins", "tuple") => Callable::Builtin(Builtin::Tuple),
        ("__builtin__" | "builtins", "set" | "frozenset") => Callable::Builtin(Builtin::Set),
        ("__builtin__" | "builtins", "bytearray") => Callable::Builtin(Builtin::Bytearray),
        ("copy_reg" | "copyreg", "_reconstructor") => Callable::CopyRegReconstructor,
        ("copy_reg" | "copyreg", "__newobj__") => Callable::NewObj,
        ("_codecs", "encode") => Callable::CodecsEncode,
        _ => return None,
    };
    Some(callable)
}

pub(crate) fn resolve(module: &str, name: &str, registry: &StubRegistry) -> Result<Global> {
    let qualified = QualifiedName::new(module, name);
    let callable = native(module, name)
        .or_else(|| registry.lookup(&qualified).map(Callable::Stub))
        .or_else(|| builtin(module, name))
        .ok_or_else(|| SmplError::UnresolvedType {
            type_name: qualified.to_string(),
        })?;
    Ok(Global { name: qualified, callable })
}
