use strum_macros::Display;
use thiserror::Error;

/// The pipeline stage an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Stage {
    Deserialize,
    Extract,
    Canonicalize,
    Derive,
    Export,
    Io,
}

#[derive(Debug, Error)]
pub enum SmplError {
    #[error("malformed pickle stream at byte {offset}: {reason}")]
    MalformedStream { offset: usize, reason: String },
    #[error("unsupported pickle opcode 0x{opcode:02x} at byte {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },
    #[error("cannot resolve type `{type_name}`")]
    UnresolvedType { type_name: String },
    #[error("field `{}`: cannot extract a dense array from a value of type `{type_name}`", .field.as_deref().unwrap_or("?"))]
    ArrayExtraction { field: Option<String>, type_name: String },
    #[error("field `{field}`: expected {expected}, got {actual}")]
    SchemaValidation { field: String, expected: String, actual: String },
    #[error("kinematic tree has a cycle through joint {joint}")]
    CyclicKinematicTree { joint: usize },
    #[error("kinematic tree has several roots: {roots:?}")]
    MultipleRoots { roots: Vec<usize> },
    #[error("joint {joint} is not reachable from the root (dangling parent {parent})")]
    UnreachableJoint { joint: usize, parent: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("npz error: {0}")]
    Npz(#[from] ndarray_npy::WriteNpzError),
}

impl SmplError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::MalformedStream { .. } | Self::UnsupportedOpcode { .. } | Self::UnresolvedType { .. } => Stage::Deserialize,
            Self::ArrayExtraction { .. } => Stage::Extract,
            Self::SchemaValidation { .. } => Stage::Canonicalize,
            Self::CyclicKinematicTree { .. } | Self::MultipleRoots { .. } | Self::UnreachableJoint { .. } => Stage::Derive,
            Self::Json(_) | Self::Npz(_) => Stage::Export,
            Self::Io(_) => Stage::Io,
        }
    }

    /// The model field the error refers to, when it is known
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::ArrayExtraction { field, .. } => field.as_deref(),
            Self::SchemaValidation { field, .. } => Some(field),
            Self::CyclicKinematicTree { .. } | Self::MultipleRoots { .. } | Self::UnreachableJoint { .. } => Some("kintree_table"),
            _ => None,
        }
    }

    #[must_use]
    pub fn in_field(self, name: &str) -> Self {
        match self {
            Self::ArrayExtraction { field: None, type_name } => Self::ArrayExtraction {
                field: Some(name.to_string()),
                type_name,
            },
            other => other,
        }
    }

    pub(crate) fn schema(field: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::SchemaValidation {
            field: field.to_string(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T, E = SmplError> = std::result::Result<T, E>;
