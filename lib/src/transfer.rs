use crate::{
    lbfgs::{Lbfgs, LbfgsParams, Objective},
    model::{self, Pipeline},
    tensor::{self, Tensor},
    utils, Backbone, Error, ExecutionContext, Normalization,
};
use std::path::{Path, PathBuf};

/// The depths that receive a content tap by default
pub const DEFAULT_CONTENT_LAYERS: &[&str] = &["conv_5"];
/// The depths that receive a style tap by default
pub const DEFAULT_STYLE_LAYERS: &[&str] = &["conv_1", "conv_3", "conv_4"];

/// Everything that controls a single optimization run
#[derive(Clone, Debug)]
pub struct TransferParams {
    /// The evaluation budget, the run stops once the step counter exceeds it
    pub num_steps: u32,
    pub style_weight: f32,
    pub content_weight: f32,
    pub content_layers: Vec<String>,
    pub style_layers: Vec<String>,
    /// Scores are reported every `log_every` steps
    pub log_every: u32,
    /// The image is snapshotted every `snapshot_every` steps
    pub snapshot_every: u32,
    pub lbfgs: LbfgsParams,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            num_steps: 300,
            style_weight: 1e6,
            content_weight: 1.0,
            content_layers: DEFAULT_CONTENT_LAYERS.iter().map(|s| (*s).to_owned()).collect(),
            style_layers: DEFAULT_STYLE_LAYERS.iter().map(|s| (*s).to_owned()).collect(),
            log_every: 10,
            snapshot_every: 25,
            lbfgs: LbfgsParams::default(),
        }
    }
}

/// The state of the optimization, handed out every `log_every` steps
pub struct ProgressUpdate<'a> {
    /// The number of evaluations done so far
    pub step: u32,
    /// The evaluation budget
    pub total: u32,
    /// The unweighted sum of the style losses
    pub style_score: f32,
    /// The unweighted sum of the content losses
    pub content_score: f32,
    /// The image that was just evaluated
    pub image: &'a Tensor,
}

/// Allows the optimizer loop to update external callers with the current
/// progress of the style transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

/// Receives intermediate images every `snapshot_every` steps
pub trait SnapshotSink {
    fn snapshot(&mut self, step: u32, image: &Tensor) -> Result<(), Error>;
}

impl<S> SnapshotSink for S
where
    S: FnMut(u32, &Tensor) -> Result<(), Error>,
{
    fn snapshot(&mut self, step: u32, image: &Tensor) -> Result<(), Error> {
        self(step, image)
    }
}

/// Writes snapshots as `step_{n}.jpg` into a directory, creating it if needed
pub struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
        }
    }

    pub fn path_for(&self, step: u32) -> PathBuf {
        self.dir.join(format!("step_{}.jpg", step))
    }
}

impl SnapshotSink for SnapshotDir {
    fn snapshot(&mut self, step: u32, image: &Tensor) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(step);
        log::debug!("saving snapshot {}", path.display());
        utils::tensor_to_rgb(image).save(&path)?;
        Ok(())
    }
}

/// The outcome of a finished run
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Summary {
    /// The number of evaluations done, which overshoots the budget by up to
    /// one optimizer step
    pub steps: u32,
    /// The unweighted scores of the last evaluation
    pub style_score: f32,
    pub content_score: f32,
}

// the callback handed to the optimizer, owning the per-evaluation bookkeeping
struct Evaluation<'a, 'p, 's> {
    pipeline: Pipeline,
    dim: (usize, usize, usize, usize),
    params: &'a TransferParams,
    step: u32,
    style_score: f32,
    content_score: f32,
    progress: Option<&'p mut dyn TransferProgress>,
    snapshots: Option<&'s mut dyn SnapshotSink>,
}

impl Objective for Evaluation<'_, '_, '_> {
    fn evaluate(&mut self, pixels: &mut [f32]) -> Result<(f32, Vec<f32>), Error> {
        tensor::clamp_unit(pixels);
        let image = tensor::from_flat(self.dim, pixels);

        self.pipeline.forward(&image)?;

        self.style_score = self.pipeline.style_losses().map(|l| l.loss()).sum();
        self.content_score = self.pipeline.content_losses().map(|l| l.loss()).sum();

        let (sw, cw) = (self.params.style_weight, self.params.content_weight);
        let loss = self.style_score * sw + self.content_score * cw;

        self.step += 1;

        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss {
                step: self.step,
                loss,
            });
        }

        let grad = self.pipeline.backward(sw, cw)?;

        // the final optimizer step may overshoot the budget, nothing is
        // reported for the extra evaluations
        if self.step <= self.params.num_steps {
            if self.step % self.params.log_every == 0 {
                log::info!(
                    "run {}: unweighted style loss {:.4} content loss {:.4}",
                    self.step,
                    self.style_score,
                    self.content_score
                );

                if let Some(progress) = &mut self.progress {
                    progress.update(ProgressUpdate {
                        step: self.step,
                        total: self.params.num_steps,
                        style_score: self.style_score,
                        content_score: self.content_score,
                        image: &image,
                    });
                }
            }

            if self.step % self.params.snapshot_every == 0 {
                if let Some(snapshots) = &mut self.snapshots {
                    snapshots.snapshot(self.step, &image)?;
                }
            }
        }

        Ok((loss, grad.iter().copied().collect()))
    }
}

/// Optimizes `input_img` in place so that its content matches `content_img`
/// and its style matches `style_img`, as measured by the activations of
/// `backbone`.
///
/// The pixels are the only thing optimized. They are clamped into `[0, 1]`
/// before every evaluation and once more after the budget is exhausted.
#[allow(clippy::too_many_arguments)]
pub fn run_style_transfer(
    backbone: &Backbone,
    normalization: &Normalization,
    content_img: &Tensor,
    style_img: &Tensor,
    input_img: &mut Tensor,
    params: &TransferParams,
    ctx: &ExecutionContext,
    progress: Option<&mut dyn TransferProgress>,
    snapshots: Option<&mut dyn SnapshotSink>,
) -> Result<Summary, Error> {
    check_params(params)?;

    log::info!("building the style transfer model");
    let pipeline = model::assemble(
        backbone,
        normalization,
        style_img,
        content_img,
        &params.content_layers,
        &params.style_layers,
        ctx,
    )?;

    let mut pixels: Vec<f32> = input_img.iter().copied().collect();
    let mut optimizer = Lbfgs::new(params.lbfgs);
    let mut eval = Evaluation {
        pipeline,
        dim: input_img.dim(),
        params,
        step: 0,
        style_score: 0.0,
        content_score: 0.0,
        progress,
        snapshots,
    };

    log::info!("optimizing");
    while eval.step <= params.num_steps {
        optimizer.step(&mut pixels, &mut eval)?;
    }

    tensor::clamp_unit(&mut pixels);
    *input_img = tensor::from_flat(input_img.dim(), &pixels);

    Ok(Summary {
        steps: eval.step,
        style_score: eval.style_score,
        content_score: eval.content_score,
    })
}

pub(crate) fn check_params(params: &TransferParams) -> Result<(), Error> {
    use crate::errors::InvalidRange;

    let weights = [
        (params.style_weight, "style-weight"),
        (params.content_weight, "content-weight"),
    ];
    for (value, name) in weights.iter().copied() {
        if !(value >= 0.0 && value.is_finite()) {
            return Err(Error::InvalidRange(InvalidRange {
                min: 0.0,
                max: f32::MAX,
                value,
                name,
            }));
        }
    }

    let intervals = [
        (params.log_every, "log-every"),
        (params.snapshot_every, "snapshot-every"),
    ];
    for (value, name) in intervals.iter().copied() {
        if value == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: value as f32,
                name,
            }));
        }
    }

    Ok(())
}
