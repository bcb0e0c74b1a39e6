use crate::{
    common::{kinematics::DerivedJoints, metadata, options::ExportOptions, smpl_model::CanonicalModel},
    error::Result,
};
use log::info;
use ndarray as nd;
use ndarray_npy::NpzWriter;
use smpl_utils::io::write_atomic;
use std::{
    io::{Cursor, Seek, Write},
    path::Path,
};

/// Key under which the regressed joint positions are stored
pub const KEY_JOINT_POSITIONS: &str = "J";

/// Writes the canonical model back out as a compressed npz archive, keyed
/// with the legacy field names so that numpy consumers can ``np.load`` it.
pub struct NpzCodec<'a> {
    pub model: &'a CanonicalModel,
    pub joints: Option<&'a DerivedJoints>,
    pub options: ExportOptions,
}

impl<'a> NpzCodec<'a> {
    pub fn new(model: &'a CanonicalModel, joints: Option<&'a DerivedJoints>, options: ExportOptions) -> Self {
        Self { model, joints, options }
    }

    /// # Errors
    /// Will return an error if the file cannot be written
    pub fn to_file(&self, path: &Path) -> Result<()> {
        info!("saving npz model in {}", path.display());
        write_atomic(path, |writer| {
            let mut npz = NpzWriter::new_compressed(writer);
            self.write_to_npz(&mut npz)?;
            npz.finish()?;
            Ok(())
        })
    }

    /// # Errors
    /// Will return an error if the archive cannot be assembled
    pub fn to_buf(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        let mut npz = NpzWriter::new_compressed(&mut cursor);
        self.write_to_npz(&mut npz)?;
        npz.finish()?;
        Ok(cursor.into_inner())
    }

    /// # Errors
    /// Will return an error if an array cannot be added
    pub fn write_to_npz<W: Write + Seek>(&self, npz: &mut NpzWriter<W>) -> Result<()> {
        let model = self.model;
        npz.add_array(metadata::KEY_VERTEX_TEMPLATE, model.vertex_template())?;
        npz.add_array(metadata::KEY_FACES, model.faces())?;
        npz.add_array(metadata::KEY_SHAPE_BASIS, model.shape_basis())?;
        npz.add_array(metadata::KEY_JOINT_REGRESSOR, model.joint_regressor())?;
        npz.add_array(metadata::KEY_SKINNING_WEIGHTS, model.skinning_weights())?;

        if let Some(pose_basis) = model.pose_basis().filter(|_| self.options.include_pose_basis) {
            npz.add_array(metadata::KEY_POSE_BASIS, pose_basis)?;
        }

        if let Some(joints) = self.joints.filter(|_| self.options.include_joints) {
            let [parents, ids] = joints.tree.to_kintree_table();
            let table = nd::Array2::from_shape_fn((2, ids.len()), |(row, j)| if row == 0 { parents[j] } else { ids[j] });
            npz.add_array(metadata::KEY_KINTREE, &table)?;
            npz.add_array(KEY_JOINT_POSITIONS, &joints.joint_positions)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::kinematics::derive_joints;
    use ndarray_npy::NpzReader;

    fn chain_model() -> CanonicalModel {
        CanonicalModel::new(
            nd::array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            nd::array![[0, 1, 2]],
            nd::Array3::zeros((3, 3, 2)),
            Some(nd::Array3::from_elem((3, 3, 9), 0.5)),
            nd::array![[1.0, 0.0, 0.0], [0.0, 0.5, 0.5]],
            nd::array![[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]],
            vec![-1, 0],
        )
        .unwrap()
    }

    fn names(buf: Vec<u8>) -> Vec<String> {
        let mut npz = NpzReader::new(Cursor::new(buf)).unwrap();
        npz.names().unwrap().into_iter().map(|n| n.trim_end_matches(".npy").to_string()).collect()
    }

    #[test]
    fn archive_uses_legacy_keys() {
        let model = chain_model();
        let joints = derive_joints(&model).unwrap();
        let buf = NpzCodec::new(&model, Some(&joints), ExportOptions::default()).to_buf().unwrap();
        assert_eq!(&buf[..2], b"PK");
        let names = names(buf);
        for key in ["v_template", "f", "shapedirs", "posedirs", "J_regressor", "weights", "kintree_table", "J"] {
            assert!(names.iter().any(|n| n == key), "missing {key} in {names:?}");
        }
    }

    #[test]
    fn shape_only_archive() {
        let model = chain_model();
        let joints = derive_joints(&model).unwrap();
        let buf = NpzCodec::new(&model, Some(&joints), ExportOptions::shape_only()).to_buf().unwrap();
        let names = names(buf);
        assert!(!names.iter().any(|n| n == "J" || n == "kintree_table" || n == "posedirs"));
        assert!(names.iter().any(|n| n == "shapedirs"));
    }
}
