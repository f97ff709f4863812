use crate::{
    color, errors,
    lbfgs::LineSearch,
    tensor::Tensor,
    transfer::{self, SnapshotDir, SnapshotSink, Summary, TransferParams, TransferProgress},
    utils::{self, load_image, ImageSource},
    Backbone, Error, ExecutionContext, Normalization,
};
use std::path::{Path, PathBuf};

/// How the image being optimized starts out
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Init {
    /// Gaussian white noise, reproducible from the seed
    Noise { seed: u64 },
    /// A copy of the content image
    Content,
}

impl Default for Init {
    fn default() -> Self {
        Self::Noise { seed: 0 }
    }
}

/// Style transfer session.
///
/// Calling `run()` will optimize a new image and return it, consuming the
/// session in the process. You can provide a `TransferProgress`
/// implementation to periodically get updates with the current image and
/// the style and content scores.
///
/// # Example
/// ```no_run
/// let backbone = neural_style::Backbone::load(
///     neural_style::Architecture::vgg19(),
///     "weights/vgg19.safetensors",
/// ).expect("failed to load backbone");
///
/// let session = neural_style::Session::builder()
///     .content(&"imgs/content.jpg")
///     .style(&"imgs/style.jpg")
///     .backbone(backbone)
///     .build().expect("failed to build session");
///
/// let styled = session.run(None).expect("failed to transfer style");
/// styled.save("out/styled.png").expect("failed to save image");
/// ```
pub struct Session {
    backbone: Backbone,
    normalization: Normalization,
    content: Tensor,
    style: Tensor,
    input: Tensor,
    params: TransferParams,
    snapshot_dir: Option<PathBuf>,
    ctx: ExecutionContext,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The content image, after resizing and cropping
    pub fn content(&self) -> &Tensor {
        &self.content
    }

    /// The style image, after resizing, cropping and color matching
    pub fn style(&self) -> &Tensor {
        &self.style
    }

    /// The image the optimization starts from
    pub fn input(&self) -> &Tensor {
        &self.input
    }

    pub fn params(&self) -> &TransferParams {
        &self.params
    }

    /// Runs the optimization and outputs the styled image.
    pub fn run(mut self, mut progress: Option<Box<dyn TransferProgress>>) -> Result<StyledImage, Error> {
        let mut snapshots = self.snapshot_dir.as_ref().map(SnapshotDir::new);

        let summary = transfer::run_style_transfer(
            &self.backbone,
            &self.normalization,
            &self.content,
            &self.style,
            &mut self.input,
            &self.params,
            &self.ctx,
            progress.as_mut().map(|p| &mut **p as &mut dyn TransferProgress),
            snapshots.as_mut().map(|s| s as &mut dyn SnapshotSink),
        )?;

        log::info!(
            "finished after {} steps: unweighted style loss {:.4} content loss {:.4}",
            summary.steps,
            summary.style_score,
            summary.content_score
        );

        Ok(StyledImage {
            tensor: self.input,
            summary,
        })
    }
}

struct Parameters {
    image_size: u32,
    crop: Option<u32>,
    init: Init,
    preserve_colors: bool,
    normalization: Normalization,
    snapshot_dir: Option<PathBuf>,
    max_thread_count: Option<usize>,
    transfer: TransferParams,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            image_size: 512,
            crop: None,
            init: Init::default(),
            preserve_colors: false,
            normalization: Normalization::imagenet(),
            snapshot_dir: None,
            max_thread_count: None,
            transfer: TransferParams::default(),
        }
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will check all of the provided inputs to verify that style
/// transfer will provide valid output
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    backbone: Option<Backbone>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose content (shapes and layout) is preserved
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose style (textures and colors) is transferred
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The frozen network whose activations the losses are measured on
    pub fn backbone(mut self, backbone: Backbone) -> Self {
        self.backbone = Some(backbone);
        self
    }

    /// The working resolution, both images are resized so their shorter
    /// edge is this many pixels.
    ///
    /// Default: 512
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    /// Crops the central `size x size` square out of both images after they
    /// are resized, which is needed when their aspect ratios differ.
    pub fn crop(mut self, size: u32) -> Self {
        self.params.crop = Some(size);
        self
    }

    /// The layers, eg `conv_5`, that get a content loss.
    ///
    /// Default: `conv_5`
    pub fn content_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.transfer.content_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// The layers, eg `conv_1`, that get a style loss.
    ///
    /// Default: `conv_1`, `conv_3`, `conv_4`
    pub fn style_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.transfer.style_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// The number of evaluations to run the optimizer for. The last
    /// optimizer step can overshoot this by a few evaluations.
    ///
    /// Default: 300
    pub fn num_steps(mut self, steps: u32) -> Self {
        self.params.transfer.num_steps = steps;
        self
    }

    /// Default: 1e6
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.transfer.style_weight = weight;
        self
    }

    /// Default: 1
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.transfer.content_weight = weight;
        self
    }

    /// How the optimized image is initialized.
    ///
    /// Default: noise with a seed of 0
    pub fn init(mut self, init: Init) -> Self {
        self.params.init = init;
        self
    }

    /// Recolors the style image with the content image's color statistics
    /// before optimizing, so the output keeps the content's palette.
    ///
    /// Default: false
    pub fn preserve_colors(mut self, preserve: bool) -> Self {
        self.params.preserve_colors = preserve;
        self
    }

    /// The per-channel constants images are standardized with before they
    /// enter the backbone.
    ///
    /// Default: the ImageNet statistics
    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.params.normalization = normalization;
        self
    }

    /// Default: 10
    pub fn log_every(mut self, steps: u32) -> Self {
        self.params.transfer.log_every = steps;
        self
    }

    /// Default: 25
    pub fn snapshot_every(mut self, steps: u32) -> Self {
        self.params.transfer.snapshot_every = steps;
        self
    }

    /// Writes the image being optimized to `dir/step_{n}.jpg` every
    /// `snapshot_every` steps.
    ///
    /// Default: no snapshots are written
    pub fn snapshot_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.params.snapshot_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Default: `LineSearch::None`
    pub fn line_search(mut self, line_search: LineSearch) -> Self {
        self.params.transfer.lbfgs.line_search = line_search;
        self
    }

    /// Controls the maximum number of threads that will be spawned at any one
    /// time in parallel.
    ///
    /// Setting this number to `1` will result in completely deterministic
    /// output, meaning that rerunning with the same inputs will always give
    /// you the same image.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content_src = self.content.ok_or(Error::MissingInput("content image"))?;
        let style_src = self.style.ok_or(Error::MissingInput("style image"))?;
        let backbone = self.backbone.ok_or(Error::MissingInput("backbone"))?;
        let params = self.params;

        let load = |src| -> Result<Tensor, Error> {
            let t = utils::image_to_tensor(&load_image(src, params.image_size)?);
            match params.crop {
                Some(size) => utils::center_crop(&t, size),
                None => Ok(t),
            }
        };

        let content = load(content_src)?;
        let mut style = load(style_src)?;

        if content.dim() != style.dim() {
            let (_, _, ch, cw) = content.dim();
            let (_, _, sh, sw) = style.dim();
            return Err(Error::SizeMismatch(errors::SizeMismatch {
                content: (cw as u32, ch as u32),
                style: (sw as u32, sh as u32),
            }));
        }

        if params.preserve_colors {
            log::info!("matching the style image's colors to the content image");
            style = color::match_colors(&content, &style);
        }

        let input = match params.init {
            Init::Noise { seed } => {
                use rand::{Rng, SeedableRng};

                let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
                Tensor::from_shape_simple_fn(content.raw_dim(), || {
                    rng.sample::<f32, _>(rand_distr::StandardNormal)
                })
            }
            Init::Content => content.clone(),
        };

        let ctx = params
            .max_thread_count
            .map(ExecutionContext::new)
            .unwrap_or_default();

        Ok(Session {
            backbone,
            normalization: params.normalization,
            content,
            style,
            input,
            params: params.transfer,
            snapshot_dir: params.snapshot_dir,
            ctx,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.image_size == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "image-size",
            }));
        }

        if let Some(crop) = self.params.crop {
            if crop == 0 || crop > self.params.image_size {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: self.params.image_size as f32,
                    value: crop as f32,
                    name: "crop",
                }));
            }
        }

        transfer::check_params(&self.params.transfer)?;

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// An image produced by `Session::run()`
pub struct StyledImage {
    tensor: Tensor,
    summary: Summary,
}

impl StyledImage {
    /// The optimized image as a `[1, 3, height, width]` tensor in `[0, 1]`
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// The step count and final scores of the run
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Saves the image to the specified path, the format is picked from its
    /// extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        utils::check_output_format(path)?;

        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        utils::tensor_to_rgb(&self.tensor).save(&path)?;
        Ok(())
    }

    /// Returns the image as 8-bit RGB
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(utils::tensor_to_rgb(&self.tensor))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layers::{Conv2d, Layer};
    use ndarray::{Array1, Array4};

    fn backbone() -> Backbone {
        let weight = Array4::from_shape_fn((2, 3, 3, 3), |(o, i, y, x)| {
            ((o * 27 + i * 9 + y * 3 + x) as f32 * 0.7).sin() * 0.2
        });
        Backbone::new(vec![
            Layer::Conv2d(Conv2d::new(weight, Array1::zeros(2), 1, 1).unwrap()),
            Layer::Relu { inplace: true },
        ])
    }

    fn image(width: u32, height: u32) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 13) as u8, (y * 17) as u8, ((x + y) * 5) as u8])
        }))
    }

    #[test]
    fn missing_inputs() {
        let result = Session::builder().style(image(8, 8)).backbone(backbone()).build();
        assert!(matches!(result, Err(Error::MissingInput("content image"))));

        let result = Session::builder().content(image(8, 8)).style(image(8, 8)).build();
        assert!(matches!(result, Err(Error::MissingInput("backbone"))));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let builder = || {
            Session::builder()
                .content(image(8, 8))
                .style(image(8, 8))
                .backbone(backbone())
                .image_size(8)
        };

        assert!(builder().build().is_ok());
        assert!(matches!(builder().image_size(0).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().style_weight(-1.0).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().content_weight(f32::NAN).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().snapshot_every(0).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().log_every(0).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().max_thread_count(0).build(), Err(Error::InvalidRange(_))));
        assert!(matches!(builder().crop(9).build(), Err(Error::InvalidRange(_))));
    }

    #[test]
    fn mismatched_aspect_ratios_need_a_crop() {
        let builder = || {
            Session::builder()
                .content(image(16, 8))
                .style(image(8, 8))
                .backbone(backbone())
                .image_size(8)
        };

        assert!(matches!(builder().build(), Err(Error::SizeMismatch(_))));

        let session = builder().crop(8).build().unwrap();
        assert_eq!(session.content().dim(), (1, 3, 8, 8));
        assert_eq!(session.style().dim(), (1, 3, 8, 8));
    }

    #[test]
    fn noise_init_is_seeded() {
        let build = |seed| {
            Session::builder()
                .content(image(8, 8))
                .style(image(8, 8))
                .backbone(backbone())
                .image_size(8)
                .init(Init::Noise { seed })
                .build()
                .unwrap()
        };

        assert_eq!(build(3).input(), build(3).input());
        assert_ne!(build(3).input(), build(4).input());

        let session = Session::builder()
            .content(image(8, 8))
            .style(image(8, 8))
            .backbone(backbone())
            .image_size(8)
            .init(Init::Content)
            .build()
            .unwrap();
        assert_eq!(session.input(), session.content());
    }

    #[test]
    fn rejects_unsupported_output_formats() {
        let styled = StyledImage {
            tensor: Tensor::zeros((1, 3, 2, 2)),
            summary: Summary {
                steps: 0,
                style_score: 0.0,
                content_score: 0.0,
            },
        };

        assert!(matches!(
            styled.save("out.tga"),
            Err(Error::UnsupportedOutputFormat(_))
        ));
        assert_eq!(styled.into_image().to_rgb8().dimensions(), (2, 2));
    }
}
