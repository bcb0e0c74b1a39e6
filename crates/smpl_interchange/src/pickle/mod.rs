//! Safe reconstruction of legacy pickled object graphs
mod opcodes;
mod reader;
pub mod registry;
mod resolver;
pub mod unpickler;
pub mod value;

pub use registry::{recording_stub, StubFactory, StubRegistry};
pub use unpickler::deserialize;
pub use value::{QualifiedName, RawValue, Scalar, Stub};
