//! Typed operations understood by the collaborators.
//!
//! Each variant carries its own parameter struct, so a payload can never arrive with the
//! wrong shape for its operation. The core uses these types for three things only:
//! validating input before dispatch, sizing the collaborator's output buffer, and
//! describing the dimensions of the result.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::payload::{checked_len, checked_pixels, ImagePayload, ValidationError};

/// Upper bound on GrabCut refinement passes accepted by the segmentation collaborator.
pub const MAX_GRABCUT_ITERATIONS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropParams {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotateAngle {
    Degree0,
    Degree90,
    Degree180,
    Degree270,
}

impl RotateAngle {
    /// Whether the rotation swaps width and height.
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, RotateAngle::Degree90 | RotateAngle::Degree270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateParams {
    pub angle: RotateAngle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlipDirection {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlipParams {
    pub direction: FlipDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResizeQuality {
    Low,
    Medium,
    High,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
    pub quality: ResizeQuality,
}

/// Lossy quality setting, 1 to 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityParams {
    pub quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionFormat {
    Jpeg,
    WebP,
    Png,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressToSizeParams {
    pub target_size: usize,
    pub format: CompressionFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveSolidColorParams {
    pub color: [u8; 3],
    pub tolerance: u8,
    pub feather: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicWandParams {
    pub seed_x: u32,
    pub seed_y: u32,
    pub tolerance: u8,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabCutParams {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub iterations: u8,
}

/// An operation and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Crop(CropParams),
    Rotate(RotateParams),
    Flip(FlipParams),
    Resize(ResizeParams),
    CompressJpeg(QualityParams),
    CompressWebp(QualityParams),
    CompressToSize(CompressToSizeParams),
    RemoveSolidColor(RemoveSolidColorParams),
    MagicWand(MagicWandParams),
    GrabCut(GrabCutParams),
}

/// The bare tag of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Crop,
    Rotate,
    Flip,
    Resize,
    CompressJpeg,
    CompressWebp,
    CompressToSize,
    RemoveSolidColor,
    MagicWand,
    #[serde(rename = "grabcut")]
    GrabCut,
}

/// Operations served by the same collaborator share one family of execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationFamily {
    /// crop, rotate, flip, resize
    Transform,
    /// jpeg, webp, compress-to-size
    Compression,
    /// background removal and selection masks
    Segmentation,
}

impl OperationFamily {
    pub const ALL: [OperationFamily; 3] = [
        OperationFamily::Transform,
        OperationFamily::Compression,
        OperationFamily::Segmentation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationFamily::Transform => "transform",
            OperationFamily::Compression => "compression",
            OperationFamily::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for OperationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Crop => "crop",
            OperationKind::Rotate => "rotate",
            OperationKind::Flip => "flip",
            OperationKind::Resize => "resize",
            OperationKind::CompressJpeg => "compress-jpeg",
            OperationKind::CompressWebp => "compress-webp",
            OperationKind::CompressToSize => "compress-to-size",
            OperationKind::RemoveSolidColor => "remove-solid-color",
            OperationKind::MagicWand => "magic-wand",
            OperationKind::GrabCut => "grabcut",
        }
    }

    pub fn family(self) -> OperationFamily {
        match self {
            OperationKind::Crop
            | OperationKind::Rotate
            | OperationKind::Flip
            | OperationKind::Resize => OperationFamily::Transform,
            OperationKind::CompressJpeg
            | OperationKind::CompressWebp
            | OperationKind::CompressToSize => OperationFamily::Compression,
            OperationKind::RemoveSolidColor | OperationKind::MagicWand | OperationKind::GrabCut => {
                OperationFamily::Segmentation
            }
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn invalid(kind: OperationKind, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidParameter {
        operation: kind.as_str(),
        reason: reason.into(),
    }
}

/// Checks that `[x, x + w) x [y, y + h)` is non-empty and lies inside the image.
fn check_rect(
    kind: OperationKind,
    (x, y, w, h): (u32, u32, u32, u32),
    input: &ImagePayload,
) -> Result<(), ValidationError> {
    if w == 0 || h == 0 {
        return Err(invalid(kind, "rectangle must have non-zero size"));
    }
    let x2 = x
        .checked_add(w)
        .ok_or_else(|| invalid(kind, "rectangle width overflow"))?;
    let y2 = y
        .checked_add(h)
        .ok_or_else(|| invalid(kind, "rectangle height overflow"))?;
    if x2 > input.width || y2 > input.height {
        return Err(invalid(
            kind,
            format!(
                "rectangle {}x{}+{}+{} out of bounds for {}x{} image",
                w, h, x, y, input.width, input.height
            ),
        ));
    }
    Ok(())
}

fn check_quality(kind: OperationKind, quality: u8) -> Result<(), ValidationError> {
    if !(1..=100).contains(&quality) {
        return Err(invalid(kind, format!("quality {} outside 1..=100", quality)));
    }
    Ok(())
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Crop(_) => OperationKind::Crop,
            Operation::Rotate(_) => OperationKind::Rotate,
            Operation::Flip(_) => OperationKind::Flip,
            Operation::Resize(_) => OperationKind::Resize,
            Operation::CompressJpeg(_) => OperationKind::CompressJpeg,
            Operation::CompressWebp(_) => OperationKind::CompressWebp,
            Operation::CompressToSize(_) => OperationKind::CompressToSize,
            Operation::RemoveSolidColor(_) => OperationKind::RemoveSolidColor,
            Operation::MagicWand(_) => OperationKind::MagicWand,
            Operation::GrabCut(_) => OperationKind::GrabCut,
        }
    }

    pub fn family(&self) -> OperationFamily {
        self.kind().family()
    }

    /// Validates the input buffer and the operation parameters against it.
    pub fn validate(&self, input: &ImagePayload) -> Result<(), ValidationError> {
        input.validate()?;
        let kind = self.kind();

        match self {
            Operation::Crop(p) => check_rect(kind, (p.x, p.y, p.width, p.height), input),
            Operation::Rotate(_) | Operation::Flip(_) => Ok(()),
            Operation::Resize(p) => {
                if p.width == 0 || p.height == 0 {
                    return Err(invalid(kind, "target dimensions must be non-zero"));
                }
                checked_len(p.width, p.height).map(|_| ())
            }
            Operation::CompressJpeg(p) | Operation::CompressWebp(p) => {
                check_quality(kind, p.quality)
            }
            Operation::CompressToSize(p) => {
                if p.target_size == 0 {
                    return Err(invalid(kind, "target size must be non-zero"));
                }
                Ok(())
            }
            Operation::RemoveSolidColor(_) => Ok(()),
            Operation::MagicWand(p) => {
                if p.seed_x >= input.width || p.seed_y >= input.height {
                    return Err(invalid(
                        kind,
                        format!("seed ({}, {}) out of bounds", p.seed_x, p.seed_y),
                    ));
                }
                Ok(())
            }
            Operation::GrabCut(p) => {
                if p.iterations == 0 || p.iterations > MAX_GRABCUT_ITERATIONS {
                    return Err(invalid(
                        kind,
                        format!(
                            "iterations {} outside 1..={}",
                            p.iterations, MAX_GRABCUT_ITERATIONS
                        ),
                    ));
                }
                check_rect(kind, (p.x, p.y, p.width, p.height), input)
            }
        }
    }

    /// Size of the output buffer handed to the collaborator.
    pub fn output_capacity(&self, input: &ImagePayload) -> Result<usize, ValidationError> {
        match self {
            Operation::Crop(p) => checked_len(p.width, p.height),
            Operation::Resize(p) => checked_len(p.width, p.height),
            Operation::MagicWand(_) | Operation::GrabCut(_) => {
                checked_pixels(input.width, input.height)
            }
            Operation::Rotate(_)
            | Operation::Flip(_)
            | Operation::CompressJpeg(_)
            | Operation::CompressWebp(_)
            | Operation::CompressToSize(_)
            | Operation::RemoveSolidColor(_) => checked_len(input.width, input.height),
        }
    }

    /// Dimensions of the produced image or mask.
    pub fn result_dimensions(&self, input: &ImagePayload) -> (u32, u32) {
        match self {
            Operation::Crop(p) => (p.width, p.height),
            Operation::Rotate(p) if p.angle.is_quarter_turn() => (input.height, input.width),
            Operation::Resize(p) => (p.width, p.height),
            _ => (input.width, input.height),
        }
    }
}
