use crate::{common::smpl_model::CanonicalModel, error::Result};
use log::info;
use ndarray as nd;
use smpl_utils::io::write_atomic;
use std::{io::Write, path::Path};

/// Wavefront OBJ view of the template mesh. Only ``v`` and ``f`` records are
/// written, faces are 1-based as OBJ wants them.
pub struct ObjCodec<'a> {
    pub vertices: nd::ArrayView2<'a, f64>,
    pub faces: nd::ArrayView2<'a, i32>,
}

impl<'a> ObjCodec<'a> {
    pub fn from_model(model: &'a CanonicalModel) -> Self {
        Self {
            vertices: model.vertex_template().view(),
            faces: model.faces().view(),
        }
    }

    /// # Errors
    /// Will return an error if the writer fails
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for v in self.vertices.rows() {
            writeln!(writer, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2])?;
        }
        for f in self.faces.rows() {
            writeln!(writer, "f {} {} {}", f[0] + 1, f[1] + 1, f[2] + 1)?;
        }
        Ok(())
    }

    /// # Errors
    /// Will return an error if the mesh cannot be formatted
    pub fn to_obj_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// # Errors
    /// Will return an error if the file cannot be written
    pub fn to_file(&self, path: &Path) -> Result<()> {
        info!("saving obj mesh in {}", path.display());
        write_atomic(path, |writer| self.write(writer))
    }
}
