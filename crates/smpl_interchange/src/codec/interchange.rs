use crate::{
    common::{kinematics::DerivedJoints, metadata::joint_names, options::ExportOptions, smpl_model::CanonicalModel},
    error::{Result, SmplError},
};
use log::info;
use ndarray as nd;
use serde::{Deserialize, Serialize};
use smpl_utils::{array::RowMajor, io::write_atomic};
use std::{
    io::{Read, Write},
    path::Path,
};

/// The JSON interchange document. Every tensor is flattened row-major and
/// its shape follows from the ``num_*`` counts. Joint fields appear only when
/// joints were exported, ``posedirs`` only when a pose basis was.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterchangeDocument {
    pub num_vertices: usize,
    pub num_faces: usize,
    pub num_betas: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_joints: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pose_params: Option<usize>,
    /// V x 3
    pub v_template: Vec<f64>,
    /// F x 3
    pub faces: Vec<i32>,
    /// B fields of V x 3
    pub shapedirs: Vec<Vec<f64>>,
    /// J x V
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub j_regressor: Option<Vec<f64>>,
    /// J x 3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joint_positions: Option<Vec<f64>>,
    /// parents (-1 for the root) and joint ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kintree_table: Option<[Vec<i32>; 2]>,
    /// V x J
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    /// V x 3 x P
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posedirs: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joint_names: Option<Vec<String>>,
}

/// Builds the document for ``model``, with joint data when ``joints`` is
/// given and the pose basis when the model has one. Pure, no I/O.
pub fn export(model: &CanonicalModel, joints: Option<&DerivedJoints>) -> InterchangeDocument {
    export_with_options(model, joints, &ExportOptions::default())
}

pub fn export_with_options(model: &CanonicalModel, joints: Option<&DerivedJoints>, options: &ExportOptions) -> InterchangeDocument {
    let joints = joints.filter(|_| options.include_joints);
    let pose_basis = model.pose_basis().filter(|_| options.include_pose_basis);
    InterchangeDocument {
        num_vertices: model.num_verts(),
        num_faces: model.num_faces(),
        num_betas: model.num_betas(),
        num_joints: joints.map(|j| j.tree.num_joints()),
        num_pose_params: pose_basis.map(|p| p.shape()[2]),
        v_template: model.vertex_template().to_row_major_vec(),
        faces: model.faces().to_row_major_vec(),
        shapedirs: (0..model.num_betas()).map(|b| model.shape_component(b).to_row_major_vec()).collect(),
        j_regressor: joints.map(|_| model.joint_regressor().to_row_major_vec()),
        joint_positions: joints.map(|j| j.joint_positions.to_row_major_vec()),
        kintree_table: joints.map(|j| j.tree.to_kintree_table()),
        weights: joints.map(|_| model.skinning_weights().to_row_major_vec()),
        posedirs: pose_basis.map(|p| p.to_row_major_vec()),
        joint_names: joints.map(|j| joint_names(j.tree.num_joints())),
    }
}

impl InterchangeDocument {
    /// # Errors
    /// Will return an error if serialization or the writer fails
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
    /// # Errors
    /// Will return an error if serialization fails
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
    /// # Errors
    /// Will return an error if ``json`` is not a valid document
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
    /// # Errors
    /// Will return an error if the reader fails or yields an invalid document
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }
    /// Writes the document to ``path``. Nothing is left at ``path`` if
    /// writing fails.
    ///
    /// # Errors
    /// Will return an error if the file cannot be written
    pub fn to_file(&self, path: &Path) -> Result<()> {
        info!("saving interchange document in {}", path.display());
        write_atomic(path, |writer| self.to_writer(writer))
    }

    // Consumer side: shapes are rebuilt from the counts alone

    /// # Errors
    /// ``SchemaValidation`` if the flat array does not match the counts
    pub fn vertex_template_array(&self) -> Result<nd::Array2<f64>> {
        reshape("v_template", &self.v_template, (self.num_vertices, 3))
    }
    /// # Errors
    /// ``SchemaValidation`` if the flat array does not match the counts
    pub fn faces_array(&self) -> Result<nd::Array2<i32>> {
        reshape("faces", &self.faces, (self.num_faces, 3))
    }
    /// The shape basis in its (V, 3, B) layout
    ///
    /// # Errors
    /// ``SchemaValidation`` if the flat arrays do not match the counts
    pub fn shape_basis_array(&self) -> Result<nd::Array3<f64>> {
        if self.shapedirs.len() != self.num_betas {
            return Err(SmplError::schema(
                "shapedirs",
                format!("{} fields", self.num_betas),
                format!("{} fields", self.shapedirs.len()),
            ));
        }
        let fields = self
            .shapedirs
            .iter()
            .map(|field| reshape("shapedirs", field, (self.num_vertices, 3)))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = fields.iter().map(|f| f.view()).collect();
        if views.is_empty() {
            return Ok(nd::Array3::zeros((self.num_vertices, 3, 0)));
        }
        nd::stack(nd::Axis(2), &views).map_err(|e| SmplError::schema("shapedirs", "stackable fields", e.to_string()))
    }
    /// # Errors
    /// ``SchemaValidation`` if joints are missing or do not match the counts
    pub fn joint_regressor_array(&self) -> Result<nd::Array2<f64>> {
        let num_joints = self.joint_count("j_regressor")?;
        reshape("j_regressor", required("j_regressor", self.j_regressor.as_deref())?, (num_joints, self.num_vertices))
    }
    /// # Errors
    /// ``SchemaValidation`` if joints are missing or do not match the counts
    pub fn joint_positions_array(&self) -> Result<nd::Array2<f64>> {
        let num_joints = self.joint_count("joint_positions")?;
        reshape("joint_positions", required("joint_positions", self.joint_positions.as_deref())?, (num_joints, 3))
    }
    /// # Errors
    /// ``SchemaValidation`` if joints are missing or do not match the counts
    pub fn weights_array(&self) -> Result<nd::Array2<f64>> {
        let num_joints = self.joint_count("weights")?;
        reshape("weights", required("weights", self.weights.as_deref())?, (self.num_vertices, num_joints))
    }
    /// ``None`` when the document carries no pose basis
    ///
    /// # Errors
    /// ``SchemaValidation`` if the pose basis does not match the counts
    pub fn pose_basis_array(&self) -> Result<Option<nd::Array3<f64>>> {
        match (&self.posedirs, self.num_pose_params) {
            (Some(flat), Some(num_pose_params)) => {
                let shape = (self.num_vertices, 3, num_pose_params);
                nd::Array3::from_shape_vec(shape, flat.clone())
                    .map(Some)
                    .map_err(|_| SmplError::schema("posedirs", format!("{} values", shape.0 * shape.1 * shape.2), format!("{} values", flat.len())))
            }
            (None, None) => Ok(None),
            _ => Err(SmplError::schema("posedirs", "posedirs together with num_pose_params", "only one of them")),
        }
    }

    fn joint_count(&self, field: &str) -> Result<usize> {
        self.num_joints.ok_or_else(|| SmplError::schema(field, "num_joints", "missing"))
    }
}

fn required<'a, T>(field: &str, values: Option<&'a [T]>) -> Result<&'a [T]> {
    values.ok_or_else(|| SmplError::schema(field, "a present field", "missing"))
}

fn reshape<T: Clone>(field: &str, flat: &[T], shape: (usize, usize)) -> Result<nd::Array2<T>> {
    nd::Array2::from_shape_vec(shape, flat.to_vec())
        .map_err(|_| SmplError::schema(field, format!("{} values", shape.0 * shape.1), format!("{} values", flat.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::kinematics::derive_joints;

    fn model(with_pose_basis: bool) -> CanonicalModel {
        let verts = nd::array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let faces = nd::array![[0, 1, 2]];
        let shape_basis = nd::Array3::from_shape_fn((3, 3, 2), |(v, c, b)| 0.1 * (v * 6 + c * 2 + b) as f64);
        let pose_basis = with_pose_basis.then(|| nd::Array3::from_elem((3, 3, 9), 0.25));
        let regressor = nd::array![[0.5, 0.5, 0.0], [0.0, 0.0, 1.0]];
        let weights = nd::array![[1.0, 0.0], [0.5, 0.5], [0.0, 1.0]];
        CanonicalModel::new(verts, faces, shape_basis, pose_basis, regressor, weights, vec![-1, 0]).unwrap()
    }

    #[test]
    fn shape_only_document_omits_joint_fields() {
        let doc = export(&model(false), None);
        let json: serde_json::Value = serde_json::from_str(&doc.to_json_string().unwrap()).unwrap();
        let keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 6);
        for key in ["num_vertices", "num_faces", "num_betas", "v_template", "faces", "shapedirs"] {
            assert!(json.get(key).is_some(), "{key} missing");
        }
        assert_eq!(json["shapedirs"].as_array().unwrap().len(), 2);
        // component 1 of vertex 0, coordinate 1: 0.1 * 3
        assert_eq!(doc.shapedirs[1][1], 0.1 * 3.0);
    }

    #[test]
    fn full_document_carries_joints_and_pose_basis() {
        let model = model(true);
        let joints = derive_joints(&model).unwrap();
        let doc = export(&model, Some(&joints));
        assert_eq!(doc.num_joints, Some(2));
        assert_eq!(doc.num_pose_params, Some(9));
        assert_eq!(doc.joint_positions.as_deref(), Some(&[0.5, 0.0, 0.0, 0.0, 1.0, 0.0][..]));
        assert_eq!(doc.kintree_table, Some([vec![-1, 0], vec![0, 1]]));
        assert_eq!(doc.joint_names, Some(vec!["joint_00".to_string(), "joint_01".to_string()]));
        assert_eq!(doc.weights.as_ref().map(Vec::len), Some(6));

        let trimmed = export_with_options(&model, Some(&joints), &ExportOptions {
            include_joints: true,
            include_pose_basis: false,
        });
        assert_eq!(trimmed.posedirs, None);
        assert_eq!(trimmed.num_pose_params, None);
    }

    #[test]
    fn consumer_rebuilds_shapes() {
        let model = model(true);
        let joints = derive_joints(&model).unwrap();
        let doc = InterchangeDocument::from_json_str(&export(&model, Some(&joints)).to_json_string().unwrap()).unwrap();
        assert_eq!(&doc.vertex_template_array().unwrap(), model.vertex_template());
        assert_eq!(&doc.faces_array().unwrap(), model.faces());
        assert_eq!(&doc.shape_basis_array().unwrap(), model.shape_basis());
        assert_eq!(&doc.joint_regressor_array().unwrap(), model.joint_regressor());
        assert_eq!(&doc.weights_array().unwrap(), model.skinning_weights());
        assert_eq!(doc.joint_positions_array().unwrap(), joints.joint_positions);
        assert_eq!(doc.pose_basis_array().unwrap().as_ref(), model.pose_basis());
    }

    #[test]
    fn inconsistent_counts_are_rejected_on_decode() {
        let mut doc = export(&model(false), None);
        doc.num_vertices = 4;
        assert!(matches!(doc.vertex_template_array(), Err(SmplError::SchemaValidation { .. })));
        assert!(matches!(doc.joint_positions_array(), Err(SmplError::SchemaValidation { .. })));
    }
}
