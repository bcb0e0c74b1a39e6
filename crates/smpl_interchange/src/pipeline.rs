use crate::{
    codec::{export_with_options, InterchangeDocument, NpzCodec, ObjCodec},
    common::{
        kinematics::{derive_joints, DerivedJoints},
        options::{ExportOptions, IngestOptions},
        smpl_model::{canonicalize_with_options, CanonicalModel},
        types::{Gender, ModelPaths},
    },
    error::{Result, SmplError},
    pickle::{deserialize, StubRegistry},
};
use log::{error, info};
use smpl_utils::io::{FileLoader, FileType};
use std::{
    io,
    path::{Path, PathBuf},
};

/// A single conversion setup. Holds no state between runs, so one pipeline
/// can be shared by several threads.
#[derive(Clone, Debug)]
pub struct Pipeline {
    pub registry: StubRegistry,
    pub ingest: IngestOptions,
    pub export: ExportOptions,
}
impl Default for Pipeline {
    fn default() -> Self {
        Self {
            registry: StubRegistry::legacy_body_model(),
            ingest: IngestOptions::default(),
            export: ExportOptions::default(),
        }
    }
}

/// Everything one run produced before anything is written
pub struct Converted {
    pub model: CanonicalModel,
    pub joints: Option<DerivedJoints>,
}

impl Converted {
    pub fn document(&self, options: &ExportOptions) -> InterchangeDocument {
        export_with_options(&self.model, self.joints.as_ref(), options)
    }
}

impl Pipeline {
    pub fn new(registry: StubRegistry, ingest: IngestOptions, export: ExportOptions) -> Self {
        Self { registry, ingest, export }
    }

    /// Deserializes and canonicalizes a pickled model
    ///
    /// # Errors
    /// the first failure of the deserialize, extract or canonicalize stage
    pub fn load_model(&self, bytes: &[u8]) -> Result<CanonicalModel> {
        let fields = deserialize(bytes, &self.registry)?;
        canonicalize_with_options(&fields, &self.ingest)
    }

    /// Runs every stage up to, but excluding, writing. Joints are derived,
    /// and the tree validated, only when they are exported.
    ///
    /// # Errors
    /// the first failure of any stage
    pub fn convert_bytes(&self, bytes: &[u8]) -> Result<Converted> {
        let model = self.load_model(bytes)?;
        let joints = if self.export.include_joints { Some(derive_joints(&model)?) } else { None };
        Ok(Converted { model, joints })
    }

    /// # Errors
    /// the first failure of any stage
    pub fn to_document(&self, bytes: &[u8]) -> Result<InterchangeDocument> {
        Ok(self.convert_bytes(bytes)?.document(&self.export))
    }

    /// Converts ``input`` into ``output``, the format being picked from the
    /// extension of ``output`` (json, obj or npz). The output file only
    /// appears once the whole run succeeded.
    ///
    /// # Errors
    /// the first failure of any stage, or an unknown output extension
    pub fn convert_file(&self, input: &Path, output: &Path) -> Result<()> {
        let format = FileType::from_path(output);
        exportable(format, &output.display().to_string())?;
        info!("converting {} to {:?}", input.display(), format);
        let bytes = FileLoader::read_all(input)?;
        let converted = self.convert_bytes(&bytes)?;
        match format {
            FileType::Obj => ObjCodec::from_model(&converted.model).to_file(output),
            FileType::Npz => NpzCodec::new(&converted.model, converted.joints.as_ref(), self.export).to_file(output),
            _ => converted.document(&self.export).to_file(output),
        }
    }

    /// Converts every gender found in ``paths`` into ``out_dir``, one thread
    /// per gender. Output files are named ``smpl_{gender}.{extension}``.
    /// A failing gender does not stop the others.
    ///
    /// # Errors
    /// if ``format`` is not json, obj or npz, before any conversion starts
    pub fn convert_all(&self, paths: &ModelPaths, out_dir: &Path, format: FileType) -> Result<Vec<(Gender, Result<PathBuf>)>> {
        exportable(format, &format!("{format:?}"))?;
        let extension = format.value()[0];
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = paths
                .iter()
                .map(|(gender, input)| {
                    let output = out_dir.join(format!("smpl_{gender}.{extension}"));
                    let handle = scope.spawn(move || self.convert_file(input, &output).map(|()| output));
                    (gender, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(gender, handle)| {
                    let res = handle.join().unwrap_or_else(|_| {
                        Err(SmplError::Io(io::Error::new(io::ErrorKind::Other, format!("conversion thread for {gender} panicked"))))
                    });
                    if let Err(err) = &res {
                        error!("{gender}: {}", report(err));
                    }
                    (gender, res)
                })
                .collect()
        });
        Ok(results)
    }
}

fn exportable(format: FileType, target: &str) -> Result<()> {
    if matches!(format, FileType::Json | FileType::Obj | FileType::Npz) {
        return Ok(());
    }
    Err(SmplError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("cannot export to {target}, expected json, obj or npz"),
    )))
}

/// One line naming the failing stage and, when known, the field
pub fn report(err: &SmplError) -> String {
    match err.field() {
        Some(field) => format!("{} stage failed on field `{field}`: {err}", err.stage()),
        None => format!("{} stage failed: {err}", err.stage()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_names_stage_and_field() {
        let err = SmplError::schema("weights", "(6890, 24)", "(6890, 23)");
        assert_eq!(report(&err), "Canonicalize stage failed on field `weights`: field `weights`: expected (6890, 24), got (6890, 23)");
        let err = SmplError::MalformedStream {
            offset: 3,
            reason: "truncated".into(),
        };
        assert!(report(&err).starts_with("Deserialize stage failed: "));
    }

    #[test]
    fn unknown_output_extension() {
        let pipeline = Pipeline::default();
        let err = pipeline.convert_file(Path::new("missing.pkl"), Path::new("out.txt")).unwrap_err();
        assert!(matches!(err, SmplError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn batch_rejects_non_export_formats_upfront() {
        let mut paths = ModelPaths::new();
        paths.set(Gender::Female, "/nonexistent/basicModel_f_lbs_10_207_0_v1.0.0.pkl");
        paths.set(Gender::Male, "/nonexistent/basicModel_m_lbs_10_207_0_v1.0.0.pkl");
        for format in [FileType::Pkl, FileType::Unknown] {
            let err = Pipeline::default().convert_all(&paths, &std::env::temp_dir(), format).unwrap_err();
            assert!(matches!(err, SmplError::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));
        }
        let results = Pipeline::default().convert_all(&paths, &std::env::temp_dir(), FileType::Json).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, res)| matches!(res, Err(SmplError::Io(_)))));
    }

    #[test]
    fn missing_input_is_io() {
        let pipeline = Pipeline::default();
        let out = std::env::temp_dir().join("smpl_interchange_missing_input.json");
        let err = pipeline.convert_file(Path::new("/nonexistent/model.pkl"), &out).unwrap_err();
        assert_eq!(err.stage(), crate::error::Stage::Io);
        assert!(!out.exists());
    }
}
