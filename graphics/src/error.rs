//! Graphics error types.

use thiserror::Error;

/// Errors that can occur in the graphics system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphicsError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// Failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// A requested feature is not supported.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// Out of GPU or host memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// The surface is outdated and the swapchain must be recreated.
    #[error("surface outdated, needs reconfiguration")]
    SurfaceOutdated,
    /// The surface was lost and must be recreated.
    #[error("surface lost, needs recreation")]
    SurfaceLost,
    /// Renderer configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Reading or writing a file failed.
    #[error("I/O error: {0}")]
    Io(String),
    /// A frame failed after its swapchain image was acquired. Its semaphores
    /// were signalled with nothing left to wait on them, so the scheduler
    /// refuses further frames and only `shutdown` remains valid.
    #[error("frame {frame} abandoned in {state}: {source}")]
    FrameAbandoned {
        frame: u64,
        state: &'static str,
        source: Box<GraphicsError>,
    },
}

impl GraphicsError {
    /// Errors after which the GPU context cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::OutOfMemory | Self::FrameAbandoned { .. }
        )
    }

    /// The only recoverable runtime condition: the swapchain no longer
    /// matches the surface.
    pub fn is_surface_stale(&self) -> bool {
        matches!(self, Self::SurfaceOutdated | Self::SurfaceLost)
    }
}

impl From<std::io::Error> for GraphicsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GraphicsError::InitializationFailed("no GPU found".to_string());
        assert_eq!(err.to_string(), "initialization failed: no GPU found");
    }

    #[test]
    fn test_error_classification() {
        assert!(GraphicsError::DeviceLost.is_fatal());
        assert!(GraphicsError::OutOfMemory.is_fatal());
        assert!(!GraphicsError::SurfaceOutdated.is_fatal());
        let abandoned = GraphicsError::FrameAbandoned {
            frame: 3,
            state: "RecordGraphics",
            source: Box::new(GraphicsError::InvalidParameter("x".into())),
        };
        assert!(abandoned.is_fatal());
        assert_eq!(
            abandoned.to_string(),
            "frame 3 abandoned in RecordGraphics: invalid parameter: x"
        );

        assert!(GraphicsError::SurfaceOutdated.is_surface_stale());
        assert!(GraphicsError::SurfaceLost.is_surface_stale());
        assert!(!GraphicsError::Internal("x".into()).is_surface_stale());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.spv");
        let err: GraphicsError = io.into();
        assert!(matches!(err, GraphicsError::Io(ref msg) if msg.contains("missing.spv")));
    }
}
