//! The loss-tapped feature pipeline and the assembler that builds it from a
//! backbone.

use crate::{
    errors::{SizeMismatch, TapKind},
    layers::Layer,
    loss::{ContentLoss, StyleLoss},
    normalization::Normalization,
    tensor::Tensor,
    Backbone, Error, ExecutionContext,
};

/// A single stage of a pipeline
#[derive(Clone, Debug)]
pub enum Stage {
    Normalization(Normalization),
    Layer(Layer),
    Content(ContentLoss),
    Style(StyleLoss),
}

impl Stage {
    #[inline]
    pub fn is_tap(&self) -> bool {
        matches!(self, Self::Content(_) | Self::Style(_))
    }
}

/// An ordered sequence of named stages: the normalization, the (substituted)
/// backbone layers and the loss taps interleaved between them.
///
/// Evaluating the pipeline records the loss on every tap, and keeps the
/// input of every layer around so the gradient with respect to the
/// pipeline's input can be computed afterwards.
#[derive(Clone, Debug)]
pub struct Pipeline {
    stages: Vec<(String, Stage)>,
    content_taps: Vec<usize>,
    style_taps: Vec<usize>,
    ctx: ExecutionContext,

    // the input of every non-tap stage during the last evaluation
    inputs: Vec<Tensor>,
    output: Option<Tensor>,
}

impl Pipeline {
    fn new(normalization: Normalization, ctx: ExecutionContext) -> Self {
        Self {
            stages: vec![("normalization".to_owned(), Stage::Normalization(normalization))],
            content_taps: Vec::new(),
            style_taps: Vec::new(),
            ctx,
            inputs: Vec::new(),
            output: None,
        }
    }

    fn push(&mut self, name: String, stage: Stage) {
        log::debug!("stage {}: {}", self.stages.len(), name);

        match stage {
            Stage::Content(_) => self.content_taps.push(self.stages.len()),
            Stage::Style(_) => self.style_taps.push(self.stages.len()),
            _ => {}
        }

        self.stages.push((name, stage));
    }

    /// Evaluates the stages built so far without touching any tap, used to
    /// capture tap targets while the pipeline is being assembled
    fn forward_detached(&self, x: &Tensor) -> Result<Tensor, Error> {
        let mut x = x.clone();
        for (_, stage) in &self.stages {
            x = match stage {
                Stage::Normalization(norm) => norm.forward(&x)?,
                Stage::Layer(layer) => layer.forward_owned(x, &self.ctx)?,
                Stage::Content(_) | Stage::Style(_) => continue,
            };
        }
        Ok(x)
    }

    // drops every stage after the deepest tap, they never contribute to a loss
    fn truncate_after_last_tap(&mut self) {
        if let Some(last) = self.stages.iter().rposition(|(_, stage)| stage.is_tap()) {
            log::debug!(
                "truncating the pipeline from {} to {} stages",
                self.stages.len(),
                last + 1
            );
            self.stages.truncate(last + 1);
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> impl DoubleEndedIterator<Item = &Stage> + ExactSizeIterator {
        self.stages.iter().map(|(_, stage)| stage)
    }

    /// The names of every stage, in evaluation order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(name, _)| name.as_str())
    }

    /// The content taps, in the order they appear in the pipeline
    pub fn content_losses(&self) -> impl Iterator<Item = &ContentLoss> {
        self.content_taps
            .iter()
            .filter_map(move |&i| match &self.stages[i].1 {
                Stage::Content(tap) => Some(tap),
                _ => None,
            })
    }

    /// The style taps, in the order they appear in the pipeline
    pub fn style_losses(&self) -> impl Iterator<Item = &StyleLoss> {
        self.style_taps
            .iter()
            .filter_map(move |&i| match &self.stages[i].1 {
                Stage::Style(tap) => Some(tap),
                _ => None,
            })
    }

    /// Evaluates every stage on `x`, recording the loss on each tap, and
    /// returns the activation of the last stage
    pub fn forward(&mut self, x: &Tensor) -> Result<&Tensor, Error> {
        self.inputs.clear();
        self.output = None;

        let mut x = x.clone();
        for (_, stage) in &mut self.stages {
            let y = match stage {
                Stage::Content(tap) => {
                    tap.forward(&x);
                    continue;
                }
                Stage::Style(tap) => {
                    tap.forward(&x);
                    continue;
                }
                Stage::Normalization(norm) => norm.forward(&x)?,
                Stage::Layer(layer) => layer.forward(&x, &self.ctx)?,
            };

            self.inputs.push(std::mem::replace(&mut x, y));
        }

        Ok(self.output.insert(x))
    }

    /// Backpropagates `style_weight * Σ style losses + content_weight * Σ
    /// content losses` from the last evaluation, and returns the gradient
    /// with respect to the pipeline's input
    pub fn backward(&self, style_weight: f32, content_weight: f32) -> Result<Tensor, Error> {
        let output = self.output.as_ref().ok_or(Error::NotEvaluated)?;

        let mut grad = Tensor::zeros(output.raw_dim());
        let mut activation = output;
        let mut inputs = self.inputs.iter().rev();

        for (_, stage) in self.stages.iter().rev() {
            match stage {
                Stage::Content(tap) => {
                    if content_weight != 0.0 {
                        grad.scaled_add(content_weight, &tap.backward(activation));
                    }
                }
                Stage::Style(tap) => {
                    if style_weight != 0.0 {
                        grad.scaled_add(style_weight, &tap.backward(activation));
                    }
                }
                Stage::Normalization(norm) => {
                    activation = inputs.next().ok_or(Error::NotEvaluated)?;
                    grad = norm.backward(grad)?;
                }
                Stage::Layer(layer) => {
                    activation = inputs.next().ok_or(Error::NotEvaluated)?;
                    grad = layer.backward(activation, grad, &self.ctx)?;
                }
            }
        }

        Ok(grad)
    }
}

/// Rebuilds `backbone` into a pipeline with content and style taps injected
/// after the layers named in `content_layers` and `style_layers`.
///
/// Layers are named after the block they belong to, where every convolution
/// starts a new block: `conv_1`, `relu_1`, `pool_1`, `conv_2`, `bn_2`, ...
/// Tap targets are captured by evaluating the content and style images
/// through the pipeline built so far, and everything after the deepest tap
/// is dropped.
#[allow(clippy::too_many_arguments)]
pub fn assemble<S: AsRef<str>>(
    backbone: &Backbone,
    normalization: &Normalization,
    style_img: &Tensor,
    content_img: &Tensor,
    content_layers: &[S],
    style_layers: &[S],
    ctx: &ExecutionContext,
) -> Result<Pipeline, Error> {
    if content_layers.is_empty() && style_layers.is_empty() {
        return Err(Error::NoTaps);
    }

    let (_, _, ch, cw) = content_img.dim();
    let (_, _, sh, sw) = style_img.dim();
    if (ch, cw) != (sh, sw) {
        return Err(Error::SizeMismatch(SizeMismatch {
            content: (cw as u32, ch as u32),
            style: (sw as u32, sh as u32),
        }));
    }

    // never touch the caller's backbone
    let layers = backbone.clone().into_layers();
    let names = canonical_names(&layers)?;

    for (kind, requested) in [(TapKind::Content, content_layers), (TapKind::Style, style_layers)] {
        if let Some(missing) = requested
            .iter()
            .find(|req| !names.iter().any(|name| name == req.as_ref()))
        {
            return Err(Error::UnknownTapLayer {
                kind,
                name: missing.as_ref().to_owned(),
            });
        }
    }

    let wants = |requested: &[S], name: &str| requested.iter().any(|req| req.as_ref() == name);

    let mut pipeline = Pipeline::new(normalization.clone(), *ctx);
    let mut block = 0;

    for (layer, name) in layers.into_iter().zip(names) {
        if layer.kind().starts_block() {
            block += 1;
        }

        pipeline.push(name.clone(), Stage::Layer(layer.substitute()));

        if wants(content_layers, &name) {
            let target = pipeline.forward_detached(content_img)?;
            pipeline.push(
                format!("content_loss_{}", block),
                Stage::Content(ContentLoss::new(target)),
            );
        }

        if wants(style_layers, &name) {
            let target_feature = pipeline.forward_detached(style_img)?;
            pipeline.push(
                format!("style_loss_{}", block),
                Stage::Style(StyleLoss::new(&target_feature)),
            );
        }
    }

    pipeline.truncate_after_last_tap();

    Ok(pipeline)
}

/// Names every layer after its kind and the block it's in, failing on the
/// first layer we don't know how to handle
fn canonical_names(layers: &[Layer]) -> Result<Vec<String>, Error> {
    let mut block = 0;
    layers
        .iter()
        .map(|layer| {
            let kind = layer.kind();
            if kind.starts_block() {
                block += 1;
            }

            kind.canonical_name(block)
                .ok_or_else(|| Error::UnrecognizedLayer(layer.type_name().to_owned()))
        })
        .collect()
}
