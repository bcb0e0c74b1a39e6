use enum_map::{Enum, EnumMap};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumIter};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Enum, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Gender {
    Neutral = 0,
    Male,
    Female,
}
impl Gender {
    /// Letter used by the legacy asset file names
    pub fn code(self) -> &'static str {
        match self {
            Gender::Neutral => "neutral",
            Gender::Male => "m",
            Gender::Female => "f",
        }
    }
    /// File names the legacy assets are distributed under, in both casings
    /// that occur in the wild
    pub fn legacy_file_names(self) -> [String; 2] {
        let code = self.code();
        [
            format!("basicModel_{code}_lbs_10_207_0_v1.0.0.pkl"),
            format!("basicmodel_{code}_lbs_10_207_0_v1.0.0.pkl"),
        ]
    }
}

/// A mapping from ``Gender`` to the pickle holding that model
#[derive(Default, Clone, Debug)]
pub struct ModelPaths {
    gender_to_path: EnumMap<Gender, Option<PathBuf>>,
}
impl ModelPaths {
    pub fn new() -> Self {
        Self::default()
    }
    /// Looks for the legacy file names of every gender inside ``dir``
    pub fn from_dir(dir: &Path) -> Self {
        let mut paths = Self::new();
        for (gender, slot) in &mut paths.gender_to_path {
            *slot = gender.legacy_file_names().iter().map(|name| dir.join(name)).find(|p| p.is_file());
        }
        paths
    }
    pub fn set(&mut self, gender: Gender, path: impl Into<PathBuf>) {
        self.gender_to_path[gender] = Some(path.into());
    }
    pub fn get(&self, gender: Gender) -> Option<&Path> {
        self.gender_to_path[gender].as_deref()
    }
    pub fn iter(&self) -> impl Iterator<Item = (Gender, &Path)> {
        self.gender_to_path.iter().filter_map(|(g, p)| p.as_deref().map(|p| (g, p)))
    }
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_names() {
        assert_eq!(Gender::Female.to_string(), "female");
        assert_eq!(Gender::Male.legacy_file_names()[1], "basicmodel_m_lbs_10_207_0_v1.0.0.pkl");
    }

    #[test]
    fn paths_are_found_in_either_casing() {
        let dir = std::env::temp_dir().join(format!("smpl_interchange_paths_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("basicmodel_m_lbs_10_207_0_v1.0.0.pkl"), b"").unwrap();
        std::fs::write(dir.join("basicModel_f_lbs_10_207_0_v1.0.0.pkl"), b"").unwrap();

        let paths = ModelPaths::from_dir(&dir);
        assert!(paths.get(Gender::Neutral).is_none());
        assert_eq!(paths.get(Gender::Male), Some(dir.join("basicmodel_m_lbs_10_207_0_v1.0.0.pkl").as_path()));
        assert_eq!(paths.iter().map(|(g, _)| g).collect::<Vec<_>>(), vec![Gender::Male, Gender::Female]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
