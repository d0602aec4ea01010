//! `env_map_gen <type> <input_file> <output_file>`
//!
//! Convolves an equirectangular environment into the maps the renderer's
//! image-based lighting reads:
//!
//! | Type | Output |
//! |------|--------|
//! | `irradiance` | 64×32 diffuse irradiance |
//! | `prefilter` | 512-wide GGX mip atlas, one level per roughness step |
//!
//! A `.hdr` output keeps float range; anything else is written as 8-bit.
//! Exits with 0 on success and 1 on bad arguments or a failed conversion.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};

use ember_graphics::environment::{
    EquirectImage, generate_irradiance, generate_prefiltered, save_environment,
};
use ember_graphics::{GraphicsError, GraphicsResult};

/// Which map to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MapKind {
    /// Cosine-weighted hemisphere convolution for diffuse lighting.
    Irradiance,
    /// GGX-filtered mip atlas for specular lighting.
    Prefilter,
}

/// Generate image-based lighting maps from an equirectangular environment.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "env_map_gen", version)]
pub struct EnvMapArgs {
    /// Map to generate.
    #[arg(value_enum)]
    pub kind: MapKind,
    /// Equirectangular source image (HDR or PNG).
    pub input: PathBuf,
    /// Destination image.
    pub output: PathBuf,
}

/// Parse `args` (without the program name) and run. Returns the process
/// exit status.
pub fn exit_status<I>(args: I) -> u8
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    if matches!(args.as_slice(), [only] if only == "help") {
        if let Err(e) = EnvMapArgs::command().print_long_help() {
            log::error!("Failed to print help: {}", e);
        }
        return 0;
    }

    let parsed = match EnvMapArgs::try_parse_from(std::iter::once("env_map_gen".to_string()).chain(args))
    {
        Ok(parsed) => parsed,
        Err(e) => {
            if let Err(io) = e.print() {
                log::error!("Failed to print usage: {}", io);
            }
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
        }
    };

    match generate(&parsed) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    }
}

/// [`exit_status`] as a process exit code.
pub fn run<I>(args: I) -> ExitCode
where
    I: IntoIterator<Item = String>,
{
    ExitCode::from(exit_status(args))
}

/// Load the input, convolve it and write the result.
pub fn generate(args: &EnvMapArgs) -> GraphicsResult<()> {
    let source = load_source(&args.input)?;
    let extent = source.extent();
    log::info!(
        "Generating {:?} map from {} ({}x{})",
        args.kind,
        args.input.display(),
        extent.width,
        extent.height
    );

    let output = match args.kind {
        MapKind::Irradiance => generate_irradiance(&source),
        MapKind::Prefilter => generate_prefiltered(&source),
    };
    save_environment(&output, &args.output)
}

fn load_source(path: &Path) -> GraphicsResult<EquirectImage> {
    if !path.is_file() {
        return Err(GraphicsError::Io(format!(
            "input file {} does not exist",
            path.display()
        )));
    }
    EquirectImage::load(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_graphics::Extent2d;
    use glam::Vec3;
    use rstest::rstest;

    fn status(args: &[&str]) -> u8 {
        exit_status(args.iter().map(|s| s.to_string()))
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("env_map_gen_{}_{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[rstest]
    #[case::bare_word(&["help"])]
    #[case::short(&["-h"])]
    #[case::long(&["--help"])]
    fn test_help_exits_zero(#[case] args: &[&str]) {
        assert_eq!(status(args), 0);
    }

    #[rstest]
    #[case::no_arguments(&[])]
    #[case::too_few(&["irradiance", "in.hdr"])]
    #[case::too_many(&["irradiance", "in.hdr", "out.hdr", "extra"])]
    #[case::unknown_type(&["specular", "in.hdr", "out.hdr"])]
    fn test_bad_arguments_exit_one(#[case] args: &[&str]) {
        assert_eq!(status(args), 1);
    }

    #[test]
    fn test_missing_input_exits_one() {
        let dir = scratch_dir("missing");
        let input = dir.join("absent.hdr");
        let output = dir.join("out.hdr");
        let args = [
            "prefilter",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
        ];
        assert_eq!(status(&args), 1);
        assert!(!output.exists());
    }

    #[test]
    fn test_parses_type_and_paths() {
        let args = EnvMapArgs::try_parse_from(["env_map_gen", "prefilter", "a.hdr", "b.png"]).unwrap();
        assert_eq!(args.kind, MapKind::Prefilter);
        assert_eq!(args.input, PathBuf::from("a.hdr"));
        assert_eq!(args.output, PathBuf::from("b.png"));
    }

    #[test]
    fn test_irradiance_of_uniform_sky() {
        let dir = scratch_dir("irradiance");
        let input = dir.join("sky.hdr");
        let output = dir.join("irradiance.hdr");
        let sky = EquirectImage::uniform(Extent2d::new(16, 8), Vec3::splat(0.5));
        save_environment(&sky, &input).unwrap();

        let args = ["irradiance", input.to_str().unwrap(), output.to_str().unwrap()];
        assert_eq!(status(&args), 0);

        let result = EquirectImage::load(&output).unwrap();
        assert_eq!(result.extent(), Extent2d::new(64, 32));
        let first = result.pixels()[0];
        assert!(first.is_finite() && first.x > 0.0);
        assert!(
            result
                .pixels()
                .iter()
                .all(|p| (*p - first).abs().max_element() < 0.05)
        );
        std::fs::remove_dir_all(dir).unwrap();
    }
}
