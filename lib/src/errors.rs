use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct SizeMismatch {
    pub(crate) content: (u32, u32),
    pub(crate) style: (u32, u32),
}

impl fmt::Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the content image ({}x{}) and the style image ({}x{}) must be the same size",
            self.content.0, self.content.1, self.style.0, self.style.1
        )
    }
}

/// Which kind of loss tap a layer name was requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapKind {
    Content,
    Style,
}

impl fmt::Display for TapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content => f.write_str("content"),
            Self::Style => f.write_str("style"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The backbone weights file could not be parsed
    Weights(safetensors::SafeTensorError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A required input, the content or style image or the backbone, was
    /// never provided
    MissingInput(&'static str),
    /// The content and style images must have the same dimensions
    SizeMismatch(SizeMismatch),
    /// The requested center crop doesn't fit inside the loaded image
    CropTooLarge { crop: u32, width: u32, height: u32 },
    /// The backbone contains a layer the model assembler doesn't know how to
    /// name or substitute
    UnrecognizedLayer(String),
    /// A content or style tap was requested at a depth that never occurs in
    /// the backbone
    UnknownTapLayer { kind: TapKind, name: String },
    /// Neither content nor style taps were requested, so there is nothing to
    /// optimize against
    NoTaps,
    /// A tensor in the weights file is missing, has the wrong type, or the
    /// wrong shape for the requested architecture
    WeightShape {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /// A tensor in the weights file isn't stored as 32-bit floats
    UnsupportedWeightType { key: String, dtype: String },
    /// A sliding window (convolution or pooling) doesn't fit in its input,
    /// usually because the working resolution is too small for the depth of
    /// the requested taps
    InputTooSmall {
        height: usize,
        width: usize,
        kernel: (usize, usize),
    },
    /// The normalization constants don't match the image channels
    Normalization(String),
    /// Backpropagation was requested before the pipeline was evaluated
    NotEvaluated,
    /// The total loss became NaN or infinite during optimization
    NonFiniteLoss { step: u32, loss: f32 },
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// The user specified a backbone architecture we don't know about
    UnknownArchitecture(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Weights(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::Weights(we) => write!(f, "failed to read backbone weights: {}", we),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::MissingInput(what) => write!(f, "no {} was provided", what),
            Self::SizeMismatch(sm) => write!(f, "{}", sm),
            Self::CropTooLarge {
                crop,
                width,
                height,
            } => write!(
                f,
                "a center crop of {}x{} doesn't fit in an image of {}x{}",
                crop, crop, width, height
            ),
            Self::UnrecognizedLayer(kind) => write!(f, "unrecognized layer: {}", kind),
            Self::UnknownTapLayer { kind, name } => write!(
                f,
                "the {} layer '{}' does not exist in the backbone",
                kind, name
            ),
            Self::NoTaps => write!(
                f,
                "at least 1 content or style layer must be requested to compute a loss"
            ),
            Self::WeightShape {
                key,
                expected,
                found,
            } => write!(
                f,
                "weight '{}' has shape {:?}, but {:?} is required",
                key, found, expected
            ),
            Self::UnsupportedWeightType { key, dtype } => write!(
                f,
                "weight '{}' is stored as {}, only F32 weights are supported",
                key, dtype
            ),
            Self::InputTooSmall {
                height,
                width,
                kernel,
            } => write!(
                f,
                "an input of {}x{} is too small for a {}x{} window, try a larger image size",
                width, height, kernel.1, kernel.0
            ),
            Self::Normalization(msg) => write!(f, "invalid normalization: {}", msg),
            Self::NotEvaluated => write!(
                f,
                "the pipeline must be evaluated before gradients can be computed"
            ),
            Self::NonFiniteLoss { step, loss } => write!(
                f,
                "the total loss became non-finite ({}) at step {}",
                loss, step
            ),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::UnknownArchitecture(arch) => write!(
                f,
                "the architecture '{}' is not one of: vgg11, vgg13, vgg16, vgg19 (optionally with a '-bn' suffix)",
                arch
            ),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(se: safetensors::SafeTensorError) -> Self {
        Self::Weights(se)
    }
}
