use super::{
    metadata::{
        KEY_FACES, KEY_JOINT_REGRESSOR, KEY_KINTREE, KEY_POSE_BASIS, KEY_SHAPE_BASIS, KEY_SKINNING_WEIGHTS, KEY_VERTEX_TEMPLATE, REQUIRED_FIELDS,
        ROOT_PARENT,
    },
    options::IngestOptions,
};
use crate::{
    error::{Result, SmplError},
    pickle::RawValue,
    tensor::{extract, ArrayData, DenseArray},
};
use log::{info, warn};
use ndarray as nd;
use std::collections::BTreeMap;

/// Unsigned encoding of the root parent in some legacy assets
const ROOT_PARENT_U32: i64 = u32::MAX as i64;

/// The validated, typed body model. Built once, never mutated afterwards.
///
/// Invariants upheld by every constructor:
/// * V, F, B and J are positive
/// * ``shape_basis`` is (V, 3, B), ``pose_basis`` is (V, 3, P)
/// * ``joint_regressor`` is (J, V), ``skinning_weights`` is (V, J)
/// * ``kinematic_parents`` has J entries, each ``-1`` or a joint index
/// * every face index lies in ``[0, V)``
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalModel {
    vertex_template: nd::Array2<f64>,
    faces: nd::Array2<i32>,
    shape_basis: nd::Array3<f64>,
    pose_basis: Option<nd::Array3<f64>>,
    joint_regressor: nd::Array2<f64>,
    skinning_weights: nd::Array2<f64>,
    kinematic_parents: Vec<i32>,
}

impl CanonicalModel {
    /// Assembles a model from arrays that already have their final dtype,
    /// checking counts and cross-field consistency. Tree topology is checked
    /// when joints are derived.
    ///
    /// # Errors
    /// ``SchemaValidation`` naming the first inconsistent field
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vertex_template: nd::Array2<f64>,
        faces: nd::Array2<i32>,
        shape_basis: nd::Array3<f64>,
        pose_basis: Option<nd::Array3<f64>>,
        joint_regressor: nd::Array2<f64>,
        skinning_weights: nd::Array2<f64>,
        kinematic_parents: Vec<i32>,
    ) -> Result<Self> {
        let num_verts = vertex_template.nrows();
        if num_verts == 0 || vertex_template.ncols() != 3 {
            return Err(SmplError::schema(KEY_VERTEX_TEMPLATE, "(V, 3) with V > 0", shape_str(vertex_template.shape())));
        }
        if faces.nrows() == 0 || faces.ncols() != 3 {
            return Err(SmplError::schema(KEY_FACES, "(F, 3) with F > 0", shape_str(faces.shape())));
        }
        let sb = shape_basis.shape();
        if sb[0] != num_verts || sb[1] != 3 || sb[2] == 0 {
            return Err(SmplError::schema(KEY_SHAPE_BASIS, format!("({num_verts}, 3, B) with B > 0"), shape_str(sb)));
        }
        let num_joints = joint_regressor.nrows();
        if num_joints == 0 || joint_regressor.ncols() != num_verts {
            return Err(SmplError::schema(
                KEY_JOINT_REGRESSOR,
                format!("(J, {num_verts}) with J > 0"),
                shape_str(joint_regressor.shape()),
            ));
        }
        if skinning_weights.dim() != (num_verts, num_joints) {
            return Err(SmplError::schema(
                KEY_SKINNING_WEIGHTS,
                format!("({num_verts}, {num_joints})"),
                shape_str(skinning_weights.shape()),
            ));
        }
        if kinematic_parents.len() != num_joints {
            return Err(SmplError::schema(
                KEY_KINTREE,
                format!("{num_joints} parents"),
                format!("{} parents", kinematic_parents.len()),
            ));
        }
        if let Some(pose_basis) = &pose_basis {
            let pb = pose_basis.shape();
            if pb[0] != num_verts || pb[1] != 3 || pb[2] == 0 {
                return Err(SmplError::schema(KEY_POSE_BASIS, format!("({num_verts}, 3, P) with P > 0"), shape_str(pb)));
            }
        }
        if let Some(bad) = faces.iter().find(|&&idx| usize::try_from(idx).map_or(true, |idx| idx >= num_verts)) {
            return Err(SmplError::schema(KEY_FACES, format!("vertex indices in [0, {num_verts})"), format!("index {bad}")));
        }
        Ok(Self {
            vertex_template,
            faces,
            shape_basis,
            pose_basis,
            joint_regressor,
            skinning_weights,
            kinematic_parents,
        })
    }

    pub fn vertex_template(&self) -> &nd::Array2<f64> {
        &self.vertex_template
    }
    pub fn faces(&self) -> &nd::Array2<i32> {
        &self.faces
    }
    pub fn shape_basis(&self) -> &nd::Array3<f64> {
        &self.shape_basis
    }
    /// ``None`` means no pose-dependent correction is available
    pub fn pose_basis(&self) -> Option<&nd::Array3<f64>> {
        self.pose_basis.as_ref()
    }
    pub fn joint_regressor(&self) -> &nd::Array2<f64> {
        &self.joint_regressor
    }
    pub fn skinning_weights(&self) -> &nd::Array2<f64> {
        &self.skinning_weights
    }
    pub fn kinematic_parents(&self) -> &[i32] {
        &self.kinematic_parents
    }

    pub fn num_verts(&self) -> usize {
        self.vertex_template.nrows()
    }
    pub fn num_faces(&self) -> usize {
        self.faces.nrows()
    }
    pub fn num_betas(&self) -> usize {
        self.shape_basis.shape()[2]
    }
    pub fn num_joints(&self) -> usize {
        self.joint_regressor.nrows()
    }
    pub fn num_pose_params(&self) -> Option<usize> {
        self.pose_basis.as_ref().map(|p| p.shape()[2])
    }

    /// Displacement field of shape component ``idx`` as (V, 3)
    ///
    /// # Panics
    /// Will panic if ``idx >= num_betas``
    pub fn shape_component(&self, idx: usize) -> nd::ArrayView2<'_, f64> {
        self.shape_basis.index_axis(nd::Axis(2), idx)
    }

    /// Template deformed by ``betas``. Missing betas count as zero, surplus
    /// betas are ignored.
    pub fn shaped_vertices(&self, betas: &[f64]) -> nd::Array2<f64> {
        let mut verts = self.vertex_template.clone();
        for (idx, beta) in betas.iter().take(self.num_betas()).enumerate() {
            if *beta != 0.0 {
                verts.scaled_add(*beta, &self.shape_component(idx));
            }
        }
        verts
    }
}

/// [`canonicalize_with_options`] with default options
///
/// # Errors
/// see [`canonicalize_with_options`]
pub fn canonicalize(fields: &BTreeMap<String, RawValue>) -> Result<CanonicalModel> {
    canonicalize_with_options(fields, &IngestOptions::default())
}

/// Validates the deserialized fields of a legacy asset and assembles the
/// canonical model. Checks run in order: presence of the required fields,
/// extraction and dtype coercion, per-field shapes, then cross-field counts.
///
/// # Errors
/// ``ArrayExtraction`` or ``SchemaValidation`` for the first offending field
pub fn canonicalize_with_options(fields: &BTreeMap<String, RawValue>, options: &IngestOptions) -> Result<CanonicalModel> {
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|key| !fields.contains_key(**key)) {
        return Err(SmplError::schema(missing, "a required field", "missing"));
    }
    let field = |key: &str| -> Result<DenseArray> {
        let value = fields.get(key).ok_or_else(|| SmplError::schema(key, "a required field", "missing"))?;
        extract(value).map_err(|e| e.in_field(key))
    };

    // coercion
    let vertex_template = float_tensor(KEY_VERTEX_TEMPLATE, &field(KEY_VERTEX_TEMPLATE)?)?;
    let faces = index_tensor(KEY_FACES, &field(KEY_FACES)?)?;
    let shape_basis = float_tensor(KEY_SHAPE_BASIS, &field(KEY_SHAPE_BASIS)?)?;
    let joint_regressor = float_tensor(KEY_JOINT_REGRESSOR, &field(KEY_JOINT_REGRESSOR)?)?;
    let skinning_weights = float_tensor(KEY_SKINNING_WEIGHTS, &field(KEY_SKINNING_WEIGHTS)?)?;
    let kintree = integral_tensor(KEY_KINTREE, &field(KEY_KINTREE)?)?;

    // shapes
    let vertex_template = fixed_dim::<nd::Ix2, _>(KEY_VERTEX_TEMPLATE, vertex_template, "(V, 3)")?;
    let faces = fixed_dim::<nd::Ix2, _>(KEY_FACES, faces, "(F, 3)")?;
    let shape_basis = fixed_dim::<nd::Ix3, _>(KEY_SHAPE_BASIS, shape_basis, "(V, 3, B)")?;
    let joint_regressor = fixed_dim::<nd::Ix2, _>(KEY_JOINT_REGRESSOR, joint_regressor, "(J, V)")?;
    let skinning_weights = fixed_dim::<nd::Ix2, _>(KEY_SKINNING_WEIGHTS, skinning_weights, "(V, J)")?;
    let kintree = fixed_dim::<nd::Ix2, _>(KEY_KINTREE, kintree, "(2, J)")?;
    if vertex_template.ncols() != 3 || vertex_template.nrows() == 0 {
        return Err(SmplError::schema(KEY_VERTEX_TEMPLATE, "(V, 3) with V > 0", shape_str(vertex_template.shape())));
    }
    if kintree.nrows() != 2 || kintree.ncols() == 0 {
        return Err(SmplError::schema(KEY_KINTREE, "(2, J) with J > 0", shape_str(kintree.shape())));
    }

    let num_verts = vertex_template.nrows();
    if let Some(expected) = options.expected_num_verts {
        if num_verts != expected {
            return Err(SmplError::schema(KEY_VERTEX_TEMPLATE, format!("{expected} vertices"), format!("{num_verts} vertices")));
        }
    }
    let shape_basis = truncate_betas(shape_basis, options.max_num_betas);
    if let Some(expected) = options.expected_num_betas {
        let num_betas = shape_basis.shape()[2];
        if num_betas != expected {
            return Err(SmplError::schema(KEY_SHAPE_BASIS, format!("{expected} shape components"), format!("{num_betas} shape components")));
        }
    }

    let kinematic_parents = normalize_kintree(&kintree)?;
    let pose_basis = optional_pose_basis(fields, num_verts);

    let model = CanonicalModel::new(
        vertex_template,
        faces,
        shape_basis,
        pose_basis,
        joint_regressor,
        skinning_weights,
        kinematic_parents,
    )?;
    info!(
        "canonical model: {} verts, {} faces, {} betas, {} joints, pose basis {:?}",
        model.num_verts(),
        model.num_faces(),
        model.num_betas(),
        model.num_joints(),
        model.num_pose_params()
    );
    Ok(model)
}

fn shape_str(shape: &[usize]) -> String {
    format!("{shape:?}")
}

fn fixed_dim<D: nd::Dimension, T>(key: &str, array: nd::ArrayD<T>, expected: &str) -> Result<nd::Array<T, D>> {
    let shape = shape_str(array.shape());
    array.into_dimensionality::<D>().map_err(|_| SmplError::schema(key, expected, shape))
}

/// Geometric tensors become finite ``f64``
fn float_tensor(key: &str, array: &DenseArray) -> Result<nd::ArrayD<f64>> {
    let values = array.to_f64();
    if let Some((idx, bad)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(SmplError::schema(key, "finite floating point values", format!("{bad} at flat index {idx}")));
    }
    Ok(values)
}

/// Index tensors must hold whole numbers, whatever dtype they were stored with
#[allow(clippy::cast_possible_truncation)]
fn integral_tensor(key: &str, array: &DenseArray) -> Result<nd::ArrayD<i64>> {
    match array.data() {
        ArrayData::Int(values) => Ok(values.clone()),
        ArrayData::Float(values) => {
            if let Some(bad) = values.iter().find(|v| v.fract() != 0.0 || !v.is_finite() || v.abs() > 2f64.powi(53)) {
                return Err(SmplError::schema(key, "integral values", format!("{bad} ({} array)", array.dtype())));
            }
            Ok(values.mapv(|v| v as i64))
        }
    }
}

fn index_tensor(key: &str, array: &DenseArray) -> Result<nd::ArrayD<i32>> {
    let values = integral_tensor(key, array)?;
    if let Some(bad) = values.iter().find(|v| i32::try_from(**v).is_err()) {
        return Err(SmplError::schema(key, "32-bit integer values", bad.to_string()));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(values.mapv(|v| v as i32))
}

fn truncate_betas(shape_basis: nd::Array3<f64>, max_num_betas: Option<usize>) -> nd::Array3<f64> {
    match max_num_betas {
        Some(max) if max < shape_basis.shape()[2] => {
            info!("keeping {max} of {} shape components", shape_basis.shape()[2]);
            shape_basis.slice_axis(nd::Axis(2), nd::Slice::from(0..max)).to_owned()
        }
        _ => shape_basis,
    }
}

/// Turns the (2, J) legacy table into one parent per column. Row 0 holds
/// parent ids, row 1 the id of each column's joint. The root parent may be
/// stored as ``-1`` or as ``2^32 - 1``. When row 1 is a permutation of
/// ``0..J`` parent ids are translated to column indices.
fn normalize_kintree(table: &nd::Array2<i64>) -> Result<Vec<i32>> {
    let num_joints = table.ncols();
    let ids = table.row(1);
    let is_identity = ids.iter().enumerate().all(|(col, id)| usize::try_from(*id).is_ok_and(|id| id == col));
    let id_to_col: Option<Vec<usize>> = if is_identity {
        None
    } else {
        let mut id_to_col = vec![usize::MAX; num_joints];
        for (col, id) in ids.iter().enumerate() {
            let slot = usize::try_from(*id).ok().and_then(|id| id_to_col.get_mut(id)).filter(|slot| **slot == usize::MAX);
            match slot {
                Some(slot) => *slot = col,
                None => {
                    return Err(SmplError::schema(
                        KEY_KINTREE,
                        format!("row 1 to be a permutation of 0..{num_joints}"),
                        format!("joint id {id} at column {col}"),
                    ))
                }
            }
        }
        Some(id_to_col)
    };

    table
        .row(0)
        .iter()
        .map(|&parent| {
            if parent == i64::from(ROOT_PARENT) || parent == ROOT_PARENT_U32 {
                return Ok(ROOT_PARENT);
            }
            // ids without a column pass through and are rejected during derivation
            let parent = match (&id_to_col, usize::try_from(parent)) {
                (Some(map), Ok(id)) => map.get(id).map_or(parent, |col| i64::try_from(*col).unwrap_or(parent)),
                _ => parent,
            };
            i32::try_from(parent).map_err(|_| SmplError::schema(KEY_KINTREE, "32-bit parent ids", parent.to_string()))
        })
        .collect()
}

/// The pose basis is optional: absent, unextractable or misshapen all mean
/// "no pose basis"
fn optional_pose_basis(fields: &BTreeMap<String, RawValue>, num_verts: usize) -> Option<nd::Array3<f64>> {
    let value = fields.get(KEY_POSE_BASIS)?;
    let pose_basis = extract(value)
        .map_err(|e| e.in_field(KEY_POSE_BASIS))
        .and_then(|array| float_tensor(KEY_POSE_BASIS, &array))
        .and_then(|array| fixed_dim::<nd::Ix3, _>(KEY_POSE_BASIS, array, "(V, 3, P)"))
        .and_then(|array| {
            let shape = array.shape();
            if shape[0] == num_verts && shape[1] == 3 && shape[2] > 0 {
                Ok(array)
            } else {
                Err(SmplError::schema(KEY_POSE_BASIS, format!("({num_verts}, 3, P) with P > 0"), shape_str(shape)))
            }
        });
    match pose_basis {
        Ok(pose_basis) => Some(pose_basis),
        Err(e) => {
            warn!("dropping pose basis: {e}");
            None
        }
    }
}
