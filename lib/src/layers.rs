use crate::{
    tensor::{self, Tensor, Window},
    Error, ExecutionContext, InvalidRange,
};
use ndarray::{Array1, Array2, Array4, Zip};
use std::fmt;

/// A convolution with frozen weights
#[derive(Clone, Debug)]
pub struct Conv2d {
    // the kernel flattened to [out_channels, in_channels * kh * kw]
    weight: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    window: Window,
}

impl Conv2d {
    /// Creates a convolution from a `[out, in, kh, kw]` kernel and a bias of
    /// length `out`
    pub fn new(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, Error> {
        let (out_channels, in_channels, kh, kw) = weight.dim();

        if bias.len() != out_channels {
            return Err(Error::WeightShape {
                key: "bias".to_owned(),
                expected: vec![out_channels],
                found: vec![bias.len()],
            });
        }

        if stride == 0 {
            return Err(Error::InvalidRange(InvalidRange {
                min: 1.0,
                max: usize::MAX as f32,
                value: 0.0,
                name: "conv2d stride",
            }));
        }

        let flat = Array2::from_shape_fn((out_channels, in_channels * kh * kw), |(o, r)| {
            weight[[o, r / (kh * kw), (r / kw) % kh, r % kw]]
        });

        Ok(Self {
            weight: flat,
            bias,
            in_channels,
            window: Window {
                kernel: (kh, kw),
                stride: (stride, stride),
                padding: (padding, padding),
            },
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    fn check_input(&self, x: &Tensor) -> Result<(), Error> {
        let channels = x.dim().1;
        if channels != self.in_channels {
            return Err(Error::WeightShape {
                key: "conv2d input channels".to_owned(),
                expected: vec![self.in_channels],
                found: vec![channels],
            });
        }
        Ok(())
    }
}

/// Batch normalization in inference mode, the running statistics are folded
/// into a per-channel affine transform
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(
        weight: Array1<f32>,
        bias: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        eps: f32,
    ) -> Result<Self, Error> {
        let channels = weight.len();
        for (key, len) in [
            ("bias", bias.len()),
            ("running_mean", running_mean.len()),
            ("running_var", running_var.len()),
        ] {
            if len != channels {
                return Err(Error::WeightShape {
                    key: key.to_owned(),
                    expected: vec![channels],
                    found: vec![len],
                });
            }
        }

        let scale = Zip::from(&weight)
            .and(&running_var)
            .map_collect(|&w, &var| w / (var + eps).sqrt());
        let shift = Zip::from(&bias)
            .and(&running_mean)
            .and(&scale)
            .map_collect(|&b, &mean, &s| b - mean * s);

        Ok(Self { scale, shift })
    }

    pub fn channels(&self) -> usize {
        self.scale.len()
    }
}

/// The coarse category of a layer, which is all the model assembler needs
/// to know to name a layer and decide whether it must be substituted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Activation,
    Pooling,
    Normalization,
    Unrecognized,
}

impl LayerKind {
    /// The canonical name of a layer of this kind in the block started by the
    /// `block`-th convolution, eg `conv_3`, `relu_3`, `pool_3`, `bn_3`.
    ///
    /// The caller is responsible for incrementing `block` *before* naming a
    /// convolution, see `starts_block`.
    pub fn canonical_name(self, block: usize) -> Option<String> {
        let prefix = match self {
            Self::Convolution => "conv",
            Self::Activation => "relu",
            Self::Pooling => "pool",
            Self::Normalization => "bn",
            Self::Unrecognized => return None,
        };

        Some(format!("{}_{}", prefix, block))
    }

    /// Every convolution starts a new block
    #[inline]
    pub fn starts_block(self) -> bool {
        self == Self::Convolution
    }
}

/// A single stage of a convolutional backbone
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    /// Rectified linear unit. An in-place ReLU overwrites its input buffer
    /// instead of allocating a new one.
    Relu { inplace: bool },
    MaxPool2d(Window),
    AvgPool2d(Window),
    BatchNorm2d(BatchNorm2d),
    /// A layer we have no implementation for, eg a dropout or linear layer
    /// from a classifier head, kept by its type name
    Other(String),
}

impl Layer {
    pub fn relu() -> Self {
        Self::Relu { inplace: false }
    }

    /// A 2x2 max pool with a stride of 2, as used by the VGG family
    pub fn max_pool() -> Self {
        Self::MaxPool2d(Window::square(2, 2, 0))
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2d(_) => LayerKind::Convolution,
            Self::Relu { .. } => LayerKind::Activation,
            Self::MaxPool2d(_) | Self::AvgPool2d(_) => LayerKind::Pooling,
            Self::BatchNorm2d(_) => LayerKind::Normalization,
            Self::Other(_) => LayerKind::Unrecognized,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Conv2d(_) => "Conv2d",
            Self::Relu { .. } => "ReLU",
            Self::MaxPool2d(_) => "MaxPool2d",
            Self::AvgPool2d(_) => "AvgPool2d",
            Self::BatchNorm2d(_) => "BatchNorm2d",
            Self::Other(name) => name,
        }
    }

    /// Whether evaluating this layer overwrites its input
    pub fn is_inplace(&self) -> bool {
        matches!(self, Self::Relu { inplace: true })
    }

    /// Returns the side-effect-free equivalent of this layer for use inside
    /// a loss-tapped pipeline.
    ///
    /// Activations are made out-of-place, since a tap holds on to the
    /// activation it just measured, and max pooling is swapped for average
    /// pooling with the same geometry, which gives smoother gradients when
    /// synthesizing images.
    pub fn substitute(self) -> Self {
        match self {
            Self::Relu { .. } => Self::Relu { inplace: false },
            Self::MaxPool2d(window) => Self::AvgPool2d(window),
            other => other,
        }
    }

    /// Evaluates the layer, leaving the input untouched
    pub fn forward(&self, x: &Tensor, ctx: &ExecutionContext) -> Result<Tensor, Error> {
        match self {
            Self::Conv2d(conv) => {
                conv.check_input(x)?;
                tensor::conv2d(x, &conv.weight, &conv.bias, &conv.window, ctx)
            }
            Self::Relu { .. } => Ok(x.mapv(relu)),
            Self::MaxPool2d(window) => tensor::max_pool2d(x, window),
            Self::AvgPool2d(window) => tensor::avg_pool2d(x, window),
            Self::BatchNorm2d(bn) => {
                let mut y = x.clone();
                bn.apply(&mut y)?;
                Ok(y)
            }
            Self::Other(name) => Err(Error::UnrecognizedLayer(name.clone())),
        }
    }

    /// Evaluates the layer on an owned input, reusing its buffer when the
    /// layer is in-place
    pub fn forward_owned(&self, mut x: Tensor, ctx: &ExecutionContext) -> Result<Tensor, Error> {
        match self {
            Self::Relu { inplace: true } => {
                x.mapv_inplace(relu);
                Ok(x)
            }
            Self::BatchNorm2d(bn) => {
                bn.apply(&mut x)?;
                Ok(x)
            }
            other => other.forward(&x, ctx),
        }
    }

    /// Given the input `x` the layer was evaluated on and the gradient of
    /// the loss with respect to the layer's output, returns the gradient with
    /// respect to `x`. The layer's own parameters never receive a gradient.
    pub fn backward(&self, x: &Tensor, grad: Tensor, ctx: &ExecutionContext) -> Result<Tensor, Error> {
        match self {
            Self::Conv2d(conv) => Ok(tensor::conv2d_backward(
                x,
                &conv.weight,
                &conv.window,
                &grad,
                ctx,
            )),
            Self::Relu { .. } => {
                let mut grad = grad;
                Zip::from(&mut grad).and(x).for_each(|g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                Ok(grad)
            }
            Self::MaxPool2d(window) => Ok(tensor::max_pool2d_backward(x, window, &grad)),
            Self::AvgPool2d(window) => Ok(tensor::avg_pool2d_backward(x, window, &grad)),
            Self::BatchNorm2d(bn) => {
                let mut grad = grad;
                for (c, mut channel) in grad.axis_iter_mut(ndarray::Axis(1)).enumerate() {
                    channel *= bn.scale[c];
                }
                Ok(grad)
            }
            Self::Other(name) => Err(Error::UnrecognizedLayer(name.clone())),
        }
    }
}

impl BatchNorm2d {
    fn apply(&self, x: &mut Tensor) -> Result<(), Error> {
        let channels = x.dim().1;
        if channels != self.channels() {
            return Err(Error::WeightShape {
                key: "batch norm input channels".to_owned(),
                expected: vec![self.channels()],
                found: vec![channels],
            });
        }

        for (c, mut channel) in x.axis_iter_mut(ndarray::Axis(1)).enumerate() {
            let (scale, shift) = (self.scale[c], self.shift[c]);
            channel.mapv_inplace(|v| v * scale + shift);
        }

        Ok(())
    }
}

#[inline]
fn relu(v: f32) -> f32 {
    v.max(0.0)
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv2d(conv) => write!(
                f,
                "Conv2d({}, {}, kernel_size={:?}, stride={:?}, padding={:?})",
                conv.in_channels,
                conv.out_channels(),
                conv.window.kernel,
                conv.window.stride,
                conv.window.padding
            ),
            Self::Relu { inplace } => write!(f, "ReLU(inplace={})", inplace),
            Self::MaxPool2d(w) | Self::AvgPool2d(w) => write!(
                f,
                "{}(kernel_size={:?}, stride={:?}, padding={:?})",
                self.type_name(),
                w.kernel,
                w.stride,
                w.padding
            ),
            Self::BatchNorm2d(bn) => write!(f, "BatchNorm2d({})", bn.channels()),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_names() {
        assert_eq!(
            LayerKind::Convolution.canonical_name(1).as_deref(),
            Some("conv_1")
        );
        assert_eq!(
            LayerKind::Activation.canonical_name(4).as_deref(),
            Some("relu_4")
        );
        assert_eq!(LayerKind::Pooling.canonical_name(2).as_deref(), Some("pool_2"));
        assert_eq!(
            LayerKind::Normalization.canonical_name(7).as_deref(),
            Some("bn_7")
        );
        assert_eq!(LayerKind::Unrecognized.canonical_name(1), None);
    }

    #[test]
    fn substitution() {
        let relu = Layer::Relu { inplace: true }.substitute();
        assert!(!relu.is_inplace());

        match Layer::MaxPool2d(Window::square(3, 2, 1)).substitute() {
            Layer::AvgPool2d(w) => assert_eq!(w, Window::square(3, 2, 1)),
            other => panic!("expected an average pool, got {}", other),
        }

        match Layer::Other("Dropout".to_owned()).substitute() {
            Layer::Other(name) => assert_eq!(name, "Dropout"),
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn inplace_relu_reuses_buffer() {
        let ctx = ExecutionContext::single_threaded();
        let x = Tensor::from_shape_vec((1, 1, 1, 3), vec![-1.0, 0.5, 2.0]).unwrap();
        let ptr = x.as_ptr();

        let y = Layer::Relu { inplace: true }.forward_owned(x, &ctx).unwrap();
        assert_eq!(y.as_ptr(), ptr);
        assert_eq!(y.as_slice().unwrap(), &[0.0, 0.5, 2.0]);
    }

    #[test]
    fn relu_backward_masks() {
        let ctx = ExecutionContext::single_threaded();
        let x = Tensor::from_shape_vec((1, 1, 1, 3), vec![-1.0, 0.5, 2.0]).unwrap();
        let g = Tensor::from_elem((1, 1, 1, 3), 2.0);

        let gi = Layer::relu().backward(&x, g, &ctx).unwrap();
        assert_eq!(gi.as_slice().unwrap(), &[0.0, 2.0, 2.0]);
    }

    #[test]
    fn batch_norm_uses_running_stats() {
        let ctx = ExecutionContext::single_threaded();
        let bn = BatchNorm2d::new(
            Array1::from(vec![2.0]),
            Array1::from(vec![1.0]),
            Array1::from(vec![0.5]),
            Array1::from(vec![4.0]),
            0.0,
        )
        .unwrap();
        let layer = Layer::BatchNorm2d(bn);

        let x = Tensor::from_shape_vec((1, 1, 1, 2), vec![0.5, 2.5]).unwrap();
        let y = layer.forward(&x, &ctx).unwrap();
        // (x - 0.5) / 2 * 2 + 1
        assert_eq!(y.as_slice().unwrap(), &[1.0, 3.0]);

        let g = layer.backward(&x, Tensor::from_elem((1, 1, 1, 2), 1.0), &ctx).unwrap();
        assert_eq!(g.as_slice().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn unrecognized_layers_fail() {
        let ctx = ExecutionContext::single_threaded();
        let x = Tensor::zeros((1, 1, 2, 2));

        assert!(matches!(
            Layer::Other("Linear".to_owned()).forward(&x, &ctx),
            Err(Error::UnrecognizedLayer(name)) if name == "Linear"
        ));
    }

    #[test]
    fn conv_rejects_wrong_channels() {
        let ctx = ExecutionContext::single_threaded();
        let conv = Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(4), 1, 1).unwrap();
        assert_eq!(conv.in_channels(), 3);
        assert_eq!(conv.out_channels(), 4);

        let x = Tensor::zeros((1, 2, 5, 5));
        assert!(Layer::Conv2d(conv).forward(&x, &ctx).is_err());

        assert!(Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(3), 1, 1).is_err());
    }

    #[test]
    fn zero_strides_are_rejected() {
        assert!(matches!(
            Conv2d::new(Array4::zeros((1, 3, 3, 3)), Array1::zeros(1), 0, 1),
            Err(Error::InvalidRange(_))
        ));

        let ctx = ExecutionContext::single_threaded();
        let x = Tensor::zeros((1, 3, 4, 4));
        for layer in [
            Layer::MaxPool2d(Window::square(2, 0, 0)),
            Layer::AvgPool2d(Window::square(2, 0, 0)),
        ]
        .iter()
        {
            assert!(matches!(layer.forward(&x, &ctx), Err(Error::InvalidRange(_))));
        }
    }
}
