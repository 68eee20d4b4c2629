//! The external computation a context hosts.
//!
//! A collaborator is opaque to the core: it receives an input buffer, its dimensions, the
//! operation's parameters and a pre-sized output buffer, and reports how many bytes it
//! wrote. Each family implements only the operations it serves; the rest fall back to an
//! unsupported-operation failure.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{
    CompressToSizeParams, CropParams, FlipParams, GrabCutParams, MagicWandParams,
    OperationKind, QualityParams, RemoveSolidColorParams, ResizeParams, RotateParams,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{0}")]
    Failed(String),

    #[error("Operation '{0}' is not supported by this collaborator")]
    Unsupported(OperationKind),
}

impl CollaboratorError {
    pub fn failed(message: impl Into<String>) -> Self {
        CollaboratorError::Failed(message.into())
    }
}

/// Output of a compress-to-size search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedCompression {
    /// Bytes written to the output buffer
    pub size: usize,
    /// Quality that produced them
    pub quality: u8,
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Computation hosted inside an execution context.
///
/// Methods run on the context's own thread and may block for as long as the computation
/// takes.
pub trait Collaborator: Send + 'static {
    /// Loads whatever the collaborator needs before serving requests.
    fn initialize(&mut self) -> CollaboratorResult<()>;

    fn crop(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &CropParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::Crop))
    }

    fn rotate(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &RotateParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::Rotate))
    }

    fn flip(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &FlipParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::Flip))
    }

    fn resize(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &ResizeParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::Resize))
    }

    fn compress_jpeg(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &QualityParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::CompressJpeg))
    }

    fn compress_webp(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &QualityParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::CompressWebp))
    }

    fn compress_to_size(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &CompressToSizeParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<SizedCompression> {
        Err(CollaboratorError::Unsupported(OperationKind::CompressToSize))
    }

    fn remove_solid_color(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &RemoveSolidColorParams,
        _output: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::RemoveSolidColor))
    }

    fn magic_wand(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &MagicWandParams,
        _mask: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::MagicWand))
    }

    fn grabcut(
        &mut self,
        _input: &[u8],
        _width: u32,
        _height: u32,
        _params: &GrabCutParams,
        _mask: &mut [u8],
    ) -> CollaboratorResult<usize> {
        Err(CollaboratorError::Unsupported(OperationKind::GrabCut))
    }
}

/// Builds a fresh collaborator each time a context is (re)started.
pub type CollaboratorFactory = Arc<dyn Fn() -> Box<dyn Collaborator> + Send + Sync>;

/// Wraps a closure as a [`CollaboratorFactory`].
pub fn collaborator_factory<F, C>(build: F) -> CollaboratorFactory
where
    F: Fn() -> C + Send + Sync + 'static,
    C: Collaborator,
{
    Arc::new(move || Box::new(build()) as Box<dyn Collaborator>)
}
