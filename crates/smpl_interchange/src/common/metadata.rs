//! Constants of the SMPL body model and the key names of its legacy asset
pub const NUM_JOINTS: usize = 24;
pub const NUM_VERTS: usize = 6890;
pub const NUM_FACES: usize = 13776;
pub const SHAPE_SPACE_DIM: usize = 10;
pub const NUM_POSE_BLEND_SHAPES: usize = (NUM_JOINTS - 1) * 9;

/// Parent marker of the root joint in canonical form
pub const ROOT_PARENT: i32 = -1;

pub const PARENT_ID_PER_JOINT: [i32; NUM_JOINTS] = [-1, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 9, 9, 12, 13, 14, 16, 17, 18, 19, 20, 21];

pub const JOINT_NAMES: [&str; NUM_JOINTS] = [
    "pelvis",
    "left_hip",
    "right_hip",
    "spine1",
    "left_knee",
    "right_knee",
    "spine2",
    "left_ankle",
    "right_ankle",
    "spine3",
    "left_foot",
    "right_foot",
    "neck",
    "left_collar",
    "right_collar",
    "head",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hand",
    "right_hand",
];

// keys of the legacy pickle
pub const KEY_VERTEX_TEMPLATE: &str = "v_template";
pub const KEY_FACES: &str = "f";
pub const KEY_SHAPE_BASIS: &str = "shapedirs";
pub const KEY_POSE_BASIS: &str = "posedirs";
pub const KEY_JOINT_REGRESSOR: &str = "J_regressor";
pub const KEY_SKINNING_WEIGHTS: &str = "weights";
pub const KEY_KINTREE: &str = "kintree_table";

pub const REQUIRED_FIELDS: [&str; 6] = [
    KEY_VERTEX_TEMPLATE,
    KEY_FACES,
    KEY_SHAPE_BASIS,
    KEY_JOINT_REGRESSOR,
    KEY_SKINNING_WEIGHTS,
    KEY_KINTREE,
];

/// Names for ``num_joints`` joints: the SMPL names when the count matches,
/// positional names otherwise
pub fn joint_names(num_joints: usize) -> Vec<String> {
    if num_joints == NUM_JOINTS {
        JOINT_NAMES.map(std::string::ToString::to_string).to_vec()
    } else {
        (0..num_joints).map(|i| format!("joint_{i:02}")).collect()
    }
}
