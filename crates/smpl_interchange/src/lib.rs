// #![warn(
//     clippy::all,
//     // clippy::restriction,
//     clippy::pedantic,
//     // clippy::nursery,
//     // clippy::cargo
// )]
// //some lints are really just too pedantic
// #![allow(clippy::must_use_candidate)]
// #![allow(clippy::module_inception)]

//! Ingests legacy pickled SMPL body models into a validated in-memory model
//! and exports it as a JSON interchange document, an OBJ mesh or an npz
//! archive.
//!
//! The stages are usable on their own:
//! [`pickle::deserialize`] -> [`common::smpl_model::canonicalize`] ->
//! [`common::kinematics::derive_joints`] -> [`codec::export`].
//! [`pipeline::Pipeline`] chains them from file to file.

pub mod codec;
pub mod common;
pub mod error;
pub mod pickle;
pub mod pipeline;
pub mod tensor;

pub use error::{Result, SmplError, Stage};
pub use pipeline::Pipeline;
