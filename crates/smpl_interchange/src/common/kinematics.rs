use super::{metadata::ROOT_PARENT, smpl_model::CanonicalModel};
use crate::error::{Result, SmplError};
use log::info;
use ndarray as nd;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Rooted,
}

/// A parent tree over joints that is known to have exactly one root, no
/// cycles, and every joint reachable from the root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KinematicTree {
    parents: Vec<Option<usize>>,
    root: usize,
}

impl KinematicTree {
    /// Validates ``parents``, where ``-1`` marks the root.
    ///
    /// # Errors
    /// * ``MultipleRoots`` if more than one joint has the root marker
    /// * ``UnreachableJoint`` if a parent is neither the root marker nor a joint
    /// * ``CyclicKinematicTree`` if following parents from some joint never
    ///   reaches a root, which includes a tree without any root
    /// * ``SchemaValidation`` for an empty tree
    pub fn from_parents(parents: &[i32]) -> Result<Self> {
        let num_joints = parents.len();
        if num_joints == 0 {
            return Err(SmplError::schema("kintree_table", "at least one joint", "0 joints"));
        }
        let roots: Vec<usize> = parents.iter().enumerate().filter(|(_, p)| **p == ROOT_PARENT).map(|(j, _)| j).collect();
        if roots.len() > 1 {
            return Err(SmplError::MultipleRoots { roots });
        }
        let links = parents
            .iter()
            .enumerate()
            .map(|(joint, &parent)| {
                if parent == ROOT_PARENT {
                    return Ok(None);
                }
                match usize::try_from(parent) {
                    Ok(p) if p < num_joints => Ok(Some(p)),
                    _ => Err(SmplError::UnreachableJoint {
                        joint,
                        parent: i64::from(parent),
                    }),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        // ancestor walk per joint, each joint is swept at most once
        let mut marks = vec![Mark::Unvisited; num_joints];
        let mut path = Vec::with_capacity(num_joints);
        for start in 0..num_joints {
            let mut joint = start;
            loop {
                match marks[joint] {
                    Mark::Rooted => break,
                    Mark::InProgress => return Err(SmplError::CyclicKinematicTree { joint }),
                    Mark::Unvisited => {
                        marks[joint] = Mark::InProgress;
                        path.push(joint);
                        match links[joint] {
                            Some(parent) if path.len() <= num_joints => joint = parent,
                            Some(_) => return Err(SmplError::CyclicKinematicTree { joint }),
                            None => break,
                        }
                    }
                }
            }
            for j in path.drain(..) {
                marks[j] = Mark::Rooted;
            }
        }

        // reaching here with no root is impossible: the walk from joint 0 would cycle
        let root = roots.first().copied().ok_or(SmplError::CyclicKinematicTree { joint: 0 })?;
        Ok(Self { parents: links, root })
    }

    pub fn num_joints(&self) -> usize {
        self.parents.len()
    }
    pub fn root(&self) -> usize {
        self.root
    }
    pub fn parent(&self, joint: usize) -> Option<usize> {
        self.parents.get(joint).copied().flatten()
    }
    pub fn children(&self, joint: usize) -> impl Iterator<Item = usize> + '_ {
        self.parents.iter().enumerate().filter(move |(_, p)| **p == Some(joint)).map(|(j, _)| j)
    }
    /// Number of parent links between ``joint`` and the root
    pub fn depth(&self, joint: usize) -> usize {
        std::iter::successors(self.parent(joint), |j| self.parent(*j)).count()
    }

    /// Parents with ``-1`` for the root
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn parents(&self) -> Vec<i32> {
        self.parents.iter().map(|p| p.map_or(ROOT_PARENT, |p| p as i32)).collect()
    }

    /// The legacy (2, J) layout: parent ids on top, joint ids below
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn to_kintree_table(&self) -> [Vec<i32>; 2] {
        [self.parents(), (0..self.num_joints()).map(|j| j as i32).collect()]
    }
}

/// Rest pose joint locations together with the validated tree they hang in.
/// Owned by the export stage, never written back into the model.
#[derive(Clone, Debug, PartialEq)]
pub struct DerivedJoints {
    pub joint_positions: nd::Array2<f64>,
    pub tree: KinematicTree,
}

/// Validates the kinematic tree, then regresses joint positions:
/// ``joint_positions[j] = sum_v joint_regressor[j, v] * vertex_template[v]``.
///
/// # Errors
/// see [`KinematicTree::from_parents`]. No position is computed for an
/// invalid tree.
pub fn derive_joints(model: &CanonicalModel) -> Result<DerivedJoints> {
    let tree = KinematicTree::from_parents(model.kinematic_parents())?;
    let joint_positions = regress_joints(model.joint_regressor(), model.vertex_template());
    info!("derived {} joint positions, root {}", joint_positions.nrows(), tree.root());
    Ok(DerivedJoints { joint_positions, tree })
}

/// (J, V) x (V, 3) -> (J, 3)
pub fn regress_joints(joint_regressor: &nd::Array2<f64>, vertices: &nd::Array2<f64>) -> nd::Array2<f64> {
    joint_regressor.dot(vertices)
}
