pub mod interchange;
pub mod npz;
pub mod obj;

pub use interchange::{export, export_with_options, InterchangeDocument};
pub use npz::NpzCodec;
pub use obj::ObjCodec;
