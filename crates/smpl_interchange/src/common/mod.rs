pub mod kinematics;
pub mod metadata;
pub mod options;
pub mod smpl_model;
pub mod types;
