mod common;

use approx::assert_abs_diff_eq;
use common::LegacyModel;
use ndarray as nd;
use smpl_interchange::{
    codec::export,
    common::{
        kinematics::{derive_joints, KinematicTree},
        smpl_model::{canonicalize, CanonicalModel},
    },
    pickle::{deserialize, RawValue, StubRegistry},
    tensor::{extract, DenseArray, SparseMatrix},
    SmplError, Stage,
};

fn load(legacy: &LegacyModel) -> CanonicalModel {
    let fields = deserialize(&legacy.to_pickle(), &StubRegistry::legacy_body_model()).unwrap();
    canonicalize(&fields).unwrap()
}

#[test]
fn face_indices_stay_in_range() {
    for legacy in [LegacyModel::small(), LegacyModel::smpl_sized()] {
        let model = load(&legacy);
        let num_verts = i32::try_from(model.num_verts()).unwrap();
        assert!(model.faces().iter().all(|&i| (0..num_verts).contains(&i)));
    }
    let legacy = LegacyModel {
        faces: nd::array![[0, 1, 2], [0, 2, 4]],
        ..LegacyModel::small()
    };
    let fields = deserialize(&legacy.to_pickle(), &StubRegistry::legacy_body_model()).unwrap();
    let err = canonicalize(&fields).unwrap_err();
    assert_eq!(err.field(), Some("f"));
}

#[test]
fn every_shape_component_covers_every_vertex() {
    let model = load(&LegacyModel::smpl_sized());
    assert_eq!(model.num_betas(), 10);
    for b in 0..model.num_betas() {
        assert_eq!(model.shape_component(b).dim(), (model.num_verts(), 3));
    }
}

#[test]
fn tree_has_one_root_and_no_cycles() {
    let model = load(&LegacyModel::smpl_sized());
    let tree = KinematicTree::from_parents(model.kinematic_parents()).unwrap();
    assert_eq!(model.kinematic_parents().iter().filter(|p| **p == -1).count(), 1);
    for joint in 0..tree.num_joints() {
        let mut current = joint;
        let mut steps = 0;
        while let Some(parent) = tree.parent(current) {
            current = parent;
            steps += 1;
            assert!(steps <= tree.num_joints());
        }
        assert_eq!(current, tree.root());
    }
}

#[test]
fn joint_positions_scale_with_the_template() {
    let model = load(&LegacyModel::small());
    let k = 2.5;
    let scaled = CanonicalModel::new(
        model.vertex_template() * k,
        model.faces().clone(),
        model.shape_basis().clone(),
        model.pose_basis().cloned(),
        model.joint_regressor().clone(),
        model.skinning_weights().clone(),
        model.kinematic_parents().to_vec(),
    )
    .unwrap();
    let joints = derive_joints(&model).unwrap();
    let scaled_joints = derive_joints(&scaled).unwrap();
    for (a, b) in joints.joint_positions.iter().zip(scaled_joints.joint_positions.iter()) {
        assert_abs_diff_eq!(a * k, *b, epsilon = 1e-12);
    }
    // deterministic
    assert_eq!(derive_joints(&model).unwrap(), joints);
}

#[test]
fn zero_shape_basis_keeps_the_template_exact() {
    let legacy = LegacyModel::smpl_sized();
    let model = load(&legacy);
    assert_eq!(model.num_verts(), 6890);
    let shaped = model.shaped_vertices(&[0.0; 10]);
    let doc = export(&model, Some(&derive_joints(&model).unwrap()));
    assert_eq!(doc.num_betas, 10);
    for ((exported, source), shaped) in doc.v_template.iter().zip(legacy.v_template.iter()).zip(shaped.iter()) {
        assert_eq!(exported.to_bits(), source.to_bits());
        assert_eq!(shaped.to_bits(), source.to_bits());
    }
}

#[test]
fn two_roots_fail_before_regression() {
    let mut legacy = LegacyModel::smpl_sized();
    legacy.kintree_table[(0, 5)] = common::ROOT_U32;
    let model = load(&legacy);
    let err = derive_joints(&model).unwrap_err();
    assert!(matches!(err, SmplError::MultipleRoots { ref roots } if roots == &vec![0, 5]));
    assert_eq!(err.stage(), Stage::Derive);
    assert_eq!(err.field(), Some("kintree_table"));
}

#[test]
fn smpl_regressor_gives_24_joints() {
    let model = load(&LegacyModel::smpl_sized());
    assert_eq!(model.joint_regressor().dim(), (24, 6890));
    let joints = derive_joints(&model).unwrap();
    assert_eq!(joints.joint_positions.dim(), (24, 3));
    assert_eq!(joints.tree.root(), 0);
}

#[test]
fn root_joint_is_the_centroid() {
    let legacy = LegacyModel {
        v_template: nd::array![[0.0, 0.0, 0.0], [3.0, 0.0, 1.5], [0.0, 6.0, -3.0]],
        faces: nd::array![[0, 1, 2]],
        shapedirs: nd::Array3::zeros((3, 3, 1)),
        posedirs: None,
        j_regressor: nd::array![[1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0], [0.0, 1.0, 0.0]],
        weights: nd::array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]],
        ..LegacyModel::small()
    };
    let joints = derive_joints(&load(&legacy)).unwrap();
    let root = joints.joint_positions.row(0);
    assert_abs_diff_eq!(root[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(root[1], 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(root[2], -0.5, epsilon = 1e-12);
}

#[test]
fn extraction_is_idempotent() {
    let dense = RawValue::DenseArray(DenseArray::from(nd::array![[1.0, -2.0], [0.5, 4.0]]));
    let once = extract(&dense).unwrap();
    let twice = extract(&RawValue::DenseArray(once.clone())).unwrap();
    assert_eq!(once, twice);
    assert_eq!(RawValue::DenseArray(once), dense);

    let sparse = RawValue::SparseMatrix(SparseMatrix::new(2, 3, vec![(0, 2, 1.5), (1, 0, -1.0)]).unwrap());
    let first = extract(&sparse).unwrap();
    let second = extract(&sparse).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_f64(), nd::array![[0.0, 0.0, 1.5], [-1.0, 0.0, 0.0]].into_dyn());
}
