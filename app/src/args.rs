//! Command line arguments trait and default implementation.
//!
//! Uses clap for parsing, with help text (`--help`) and validation.

use std::path::{Path, PathBuf};

use clap::Parser;
use ember_graphics::config::BackendKind;
use ember_graphics::{GraphicsResult, RendererConfig};

/// Settings the shell reads before creating the window and renderer.
///
/// Every method except [`parse`](Self::parse) has a default, so custom
/// argument types only override what they change.
pub trait AppArgs: Sized {
    /// Parse command line arguments.
    fn parse() -> Self;

    /// Default: [`BackendKind::Vulkan`]
    fn backend(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    /// Default: 1280
    fn window_width(&self) -> u32 {
        1280
    }

    /// Default: 720
    fn window_height(&self) -> u32 {
        720
    }

    fn window_title(&self) -> &str {
        "Ember"
    }

    /// Default: true
    fn vsync(&self) -> bool {
        true
    }

    /// Exit after this many presented frames. Used by automated runs.
    ///
    /// Default: `None` (run until the window closes)
    fn max_frames(&self) -> Option<u64> {
        None
    }

    /// Default: `cfg!(debug_assertions)`
    fn validation(&self) -> bool {
        cfg!(debug_assertions)
    }

    /// A TOML renderer config to start from.
    fn config_path(&self) -> Option<&Path> {
        None
    }

    /// The renderer config: the file from [`config_path`](Self::config_path)
    /// or the defaults, with the device section overridden by these
    /// arguments.
    fn renderer_config(&self) -> GraphicsResult<RendererConfig> {
        let mut config = match self.config_path() {
            Some(path) => RendererConfig::load(path)?,
            None => RendererConfig::default(),
        };
        config.device.backend = self.backend();
        config.device.vsync = self.vsync();
        config.device.validation = self.validation();
        Ok(config)
    }
}

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliBackend {
    /// Native Vulkan through ash.
    #[default]
    Vulkan,
    /// Recording backend without a GPU, for CI and smoke tests.
    Dummy,
}

impl From<CliBackend> for BackendKind {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Vulkan => BackendKind::Vulkan,
            CliBackend::Dummy => BackendKind::Dummy,
        }
    }
}

/// Ember application arguments.
///
/// ```bash
/// # Run for 100 frames then exit
/// ./ember-app --max-frames 100
///
/// # Headless smoke test
/// ./ember-app --backend dummy --max-frames 10
///
/// # Start from a config file, without vsync
/// ./ember-app --config ember.toml --no-vsync
/// ```
#[derive(Parser, Debug, Clone)]
#[command(name = "ember-app", about = "Ember real-time renderer", version)]
pub struct DefaultAppArgs {
    /// Graphics backend to use.
    #[arg(long, default_value = "vulkan", value_enum)]
    pub backend: CliBackend,

    /// Initial window width in pixels.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    pub no_vsync: bool,

    /// Exit after rendering N frames.
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Enable Vulkan validation layers.
    #[arg(long, conflicts_with = "no_validation")]
    pub validation: bool,

    /// Disable Vulkan validation layers.
    #[arg(long, conflicts_with = "validation")]
    pub no_validation: bool,

    /// Renderer config file (TOML).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Default for DefaultAppArgs {
    fn default() -> Self {
        Self {
            backend: CliBackend::Vulkan,
            width: 1280,
            height: 720,
            no_vsync: false,
            max_frames: None,
            validation: false,
            no_validation: false,
            config: None,
        }
    }
}

impl DefaultAppArgs {
    /// Set the window size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the maximum number of frames.
    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }
}

impl AppArgs for DefaultAppArgs {
    fn parse() -> Self {
        <Self as Parser>::parse()
    }

    fn backend(&self) -> BackendKind {
        self.backend.into()
    }

    fn window_width(&self) -> u32 {
        self.width
    }

    fn window_height(&self) -> u32 {
        self.height
    }

    fn vsync(&self) -> bool {
        !self.no_vsync
    }

    fn max_frames(&self) -> Option<u64> {
        self.max_frames
    }

    // --validation forces on, --no-validation forces off, otherwise the
    // build profile decides.
    fn validation(&self) -> bool {
        self.validation || (!self.no_validation && cfg!(debug_assertions))
    }

    fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Result<DefaultAppArgs, clap::Error> {
        DefaultAppArgs::try_parse_from(std::iter::once("ember-app").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.window_width(), 1280);
        assert_eq!(args.window_height(), 720);
        assert!(args.vsync());
        assert_eq!(args.max_frames(), None);
        assert_eq!(args.backend(), BackendKind::Vulkan);
        assert!(args.config_path().is_none());
    }

    #[test]
    fn test_flags() {
        let args = parse(&[
            "--backend",
            "dummy",
            "--width",
            "640",
            "--height",
            "480",
            "--no-vsync",
            "--max-frames",
            "10",
            "--no-validation",
        ])
        .unwrap();
        assert_eq!(args.backend(), BackendKind::Dummy);
        assert_eq!((args.window_width(), args.window_height()), (640, 480));
        assert!(!args.vsync());
        assert_eq!(args.max_frames(), Some(10));
        assert!(!args.validation());
    }

    #[rstest]
    #[case::conflicting_validation(&["--validation", "--no-validation"])]
    #[case::unknown_backend(&["--backend", "metal"])]
    #[case::bad_width(&["--width", "wide"])]
    fn test_rejected(#[case] args: &[&str]) {
        assert!(parse(args).is_err());
    }

    #[test]
    fn test_renderer_config_applies_overrides() {
        let args = DefaultAppArgs {
            backend: CliBackend::Dummy,
            no_vsync: true,
            validation: true,
            ..Default::default()
        };
        let config = args.renderer_config().unwrap();
        assert_eq!(config.device.backend, BackendKind::Dummy);
        assert!(!config.device.vsync);
        assert!(config.device.validation);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = DefaultAppArgs {
            config: Some(PathBuf::from("/nonexistent/ember.toml")),
            ..Default::default()
        };
        assert!(args.renderer_config().is_err());
    }
}
