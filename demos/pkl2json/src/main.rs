use clap::Parser;
use log::{error, info};
use smpl_interchange::{
    common::{
        options::{ExportOptions, IngestOptions},
        types::ModelPaths,
    },
    pickle::StubRegistry,
    pipeline::report,
    Pipeline,
};
use smpl_utils::io::FileType;
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Converts legacy pickled SMPL models (basicModel_*_lbs_10_207_0_v1.0.0.pkl) into a JSON interchange document, an OBJ mesh or an npz archive"
)]
struct Args {
    /// Input pkl file
    #[arg(short, long, required_unless_present = "model_dir")]
    input: Option<PathBuf>,
    /// Output file, its extension picks the format (json, obj or npz)
    #[arg(short, long, required_unless_present = "model_dir")]
    output: Option<PathBuf>,
    /// Directory holding the legacy assets of every gender, converted in parallel
    #[arg(long, conflicts_with = "input")]
    model_dir: Option<PathBuf>,
    /// Where batch outputs go, defaults to model_dir
    #[arg(long, requires = "model_dir")]
    out_dir: Option<PathBuf>,
    /// Batch output format
    #[arg(long, default_value = "json")]
    format: String,
    /// Leave joint data out of the output
    #[arg(long)]
    no_joints: bool,
    /// Leave the pose basis out of the output
    #[arg(long)]
    no_pose_basis: bool,
    /// Keep at most this many shape components
    #[arg(long)]
    max_betas: Option<usize>,
    /// Reject assets that do not have the SMPL layout (6890 vertices, 10 betas)
    #[arg(long)]
    strict: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut ingest = if args.strict { IngestOptions::smpl() } else { IngestOptions::default() };
    ingest.max_num_betas = args.max_betas;
    let export = ExportOptions {
        include_joints: !args.no_joints,
        include_pose_basis: !args.no_pose_basis,
    };
    let pipeline = Pipeline::new(StubRegistry::legacy_body_model(), ingest, export);

    if let Some(model_dir) = args.model_dir {
        let paths = ModelPaths::from_dir(&model_dir);
        if paths.is_empty() {
            error!("no legacy model found in {}", model_dir.display());
            return ExitCode::FAILURE;
        }
        let format = FileType::find_match(&args.format);
        let out_dir = args.out_dir.unwrap_or_else(|| model_dir.clone());
        let results = match pipeline.convert_all(&paths, &out_dir, format) {
            Ok(results) => results,
            Err(err) => {
                error!("{}", report(&err));
                return ExitCode::FAILURE;
            }
        };
        let mut ok = true;
        for (gender, result) in results {
            match result {
                Ok(path) => info!("{gender}: wrote {}", path.display()),
                Err(_) => ok = false,
            }
        }
        return if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE };
    }

    let (Some(input), Some(output)) = (args.input, args.output) else {
        error!("both --input and --output are needed");
        return ExitCode::FAILURE;
    };
    match pipeline.convert_file(&input, &output) {
        Ok(()) => {
            info!("wrote {}", output.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", report(&err));
            ExitCode::FAILURE
        }
    }
}
