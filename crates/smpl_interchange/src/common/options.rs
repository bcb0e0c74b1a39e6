/// Knobs of the canonicalizer
#[derive(Clone, Debug, Default)]
pub struct IngestOptions {
    /// keep at most this many shape components
    pub max_num_betas: Option<usize>,
    /// reject models whose vertex count differs
    pub expected_num_verts: Option<usize>,
    /// reject models whose shape space (after truncation) differs
    pub expected_num_betas: Option<usize>,
}
impl IngestOptions {
    pub fn new(max_num_betas: Option<usize>) -> Self {
        Self {
            max_num_betas,
            ..Default::default()
        }
    }
    /// The layout of the distributed SMPL assets: 6890 vertices, 10 betas
    pub fn smpl() -> Self {
        Self {
            max_num_betas: None,
            expected_num_verts: Some(super::metadata::NUM_VERTS),
            expected_num_betas: Some(super::metadata::SHAPE_SPACE_DIM),
        }
    }
}

/// Which optional parts end up in the interchange document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportOptions {
    pub include_joints: bool,
    pub include_pose_basis: bool,
}
impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_joints: true,
            include_pose_basis: true,
        }
    }
}
impl ExportOptions {
    /// Template geometry and shape space only
    pub fn shape_only() -> Self {
        Self {
            include_joints: false,
            include_pose_basis: false,
        }
    }
}
