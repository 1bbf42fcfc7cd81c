use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{debug, info, warn};

use crate::candidate::CandidateStatus;
use crate::config::PsfMatchConfig;
use crate::fitter::PsfMatch;
use crate::io::{read_coordinates, read_masked_image, write_plane};
use crate::{DiffimError, Result};

/// Match the PSF of a template to each science image and write the difference
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Template fits file
    pub template: String,

    /// Glob pattern of science fits files, e.g. "science_*.fits"
    pub pattern: String,

    /// File of kernel candidate positions, one "x,y" per line
    #[arg(short, long)]
    pub coordinates: String,

    /// Fit configuration, written with defaults if it does not exist
    #[arg(long, default_value = "diffim.yaml")]
    pub config: String,

    /// Prefix of the difference image written next to each science image
    #[arg(long, default_value = "diff_")]
    pub prefix: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Load the configuration, or write one with defaults if none exists yet.
pub fn load_or_create_config(filename: &str) -> Result<PsfMatchConfig> {
    match PsfMatchConfig::from_yaml(filename) {
        Ok(config) => Ok(config),
        Err(DiffimError::IOError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            let config = PsfMatchConfig::default();
            config.to_yaml(filename)?;
            info!("wrote default configuration to {}", filename);
            Ok(config)
        }
        Err(e) => Err(e),
    }
}

fn output_path(science: &Path, prefix: &str) -> PathBuf {
    let name = science
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    science.with_file_name(format!("{}{}", prefix, name))
}

/// Difference every science image matching `pattern` against `template`.
pub fn run(args: &Args) -> Result<()> {
    // coordinates first: quickest to read, likeliest to be wrong
    let positions = read_coordinates(&args.coordinates)?;
    let config = load_or_create_config(&args.config)?;
    let matcher = PsfMatch::new(config)?;
    info!(
        "basis of {} kernels, {}x{} pixels",
        matcher.basis().len(),
        matcher.basis().dimensions().1,
        matcher.basis().dimensions().0
    );

    let template = read_masked_image(&args.template)?;
    let sciences = glob::glob(&args.pattern)?.collect::<std::result::Result<Vec<PathBuf>, _>>()?;
    if sciences.is_empty() {
        warn!("no files match {}", args.pattern);
    }

    for path in sciences {
        let filename = path.to_string_lossy().into_owned();
        info!("differencing {}", filename);
        let science = read_masked_image(&filename)?;

        let (mut cells, ineligible) = matcher.make_cell_set(&template, &science, &positions)?;
        for (pos, why) in &ineligible {
            debug!("position {},{} not used: {:?}", pos.x, pos.y, why);
        }
        let result = matcher.fit(&mut cells)?;
        info!(
            "{:?} after {} iterations with {} good and {} bad candidates",
            result.status, result.iterations, result.n_good, result.n_bad
        );

        for cand in cells.candidates() {
            let center = cand.center();
            match (cand.status(), cand.spatial_stats()) {
                (CandidateStatus::Bad, stats) => info!(
                    "candidate {:4} at {:8.2},{:8.2}: BAD ({:?}) rchi2 {:.3}",
                    cand.id(),
                    center.x,
                    center.y,
                    cand.rejection(),
                    stats.map_or(f64::NAN, |s| s.rchi2)
                ),
                (status, Some(stats)) => info!(
                    "candidate {:4} at {:8.2},{:8.2}: {:?} rchi2 {:.3} mean {:.3} rms {:.3}",
                    cand.id(),
                    center.x,
                    center.y,
                    status,
                    stats.rchi2,
                    stats.residual_mean,
                    stats.residual_rms
                ),
                (status, None) => debug!("candidate {:4}: {:?}, not assessed", cand.id(), status),
            }
        }

        let diff = matcher.subtract(&template, &science, &result)?;
        let out = output_path(&path, &args.prefix);
        write_plane(&out.to_string_lossy(), &diff.image)?;
        let center = science.bbox().center();
        info!(
            "wrote {} (kernel sum {:.5} at image center)",
            out.display(),
            result.model.kernel_sum_at(center.x, center.y)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_keeps_directory() {
        let out = output_path(Path::new("data/night1/sci_003.fits"), "diff_");
        assert_eq!(out, PathBuf::from("data/night1/diff_sci_003.fits"));
    }

    #[test]
    fn test_missing_config_is_created_with_defaults() {
        let path = std::env::temp_dir().join("diffim_cli_config_test.yaml");
        let _ = std::fs::remove_file(&path);
        let filename = path.to_str().unwrap();
        let created = load_or_create_config(filename).unwrap();
        assert_eq!(created, PsfMatchConfig::default());
        assert!(path.exists());
        assert_eq!(load_or_create_config(filename).unwrap(), created);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "diffim", "template.fits", "sci_*.fits", "-c", "stars.txt", "-vv",
        ]);
        assert_eq!(args.template, "template.fits");
        assert_eq!(args.coordinates, "stars.txt");
        assert_eq!(args.config, "diffim.yaml");
        assert_eq!(args.prefix, "diff_");
        assert_eq!(args.verbose, 2);
    }
}
