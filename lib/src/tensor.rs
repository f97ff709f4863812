//! Numeric kernels over `[batch, channels, height, width]` tensors.
//!
//! Every differentiable op comes with the vector-Jacobian product with
//! respect to its *input* only, since the backbone parameters are frozen and
//! the only thing we ever optimize is the image fed into the pipeline.

use crate::{Error, ExecutionContext, InvalidRange};
use ndarray::{linalg, Array1, Array2, Array4, ArrayView2, ArrayView3, ArrayViewMut3, Axis, Zip};

/// Images and activations are always 4D, `[batch, channels, height, width]`
pub type Tensor = Array4<f32>;

// below this many output elements a matrix product isn't worth a thread
const PARALLEL_THRESHOLD: usize = 64 * 1024;

/// Geometry of a sliding window over the spatial dimensions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl Window {
    pub fn square(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel: (kernel, kernel),
            stride: (stride, stride),
            padding: (padding, padding),
        }
    }

    /// Rejects windows with an empty kernel or a zero stride
    pub fn check(&self) -> Result<(), Error> {
        let components = [
            (self.kernel.0, "kernel height"),
            (self.kernel.1, "kernel width"),
            (self.stride.0, "vertical stride"),
            (self.stride.1, "horizontal stride"),
        ];
        for (value, name) in components.iter().copied() {
            if value == 0 {
                return Err(Error::InvalidRange(InvalidRange {
                    min: 1.0,
                    max: usize::MAX as f32,
                    value: 0.0,
                    name,
                }));
            }
        }
        Ok(())
    }

    /// The spatial output size for an input of `height x width`, rounding
    /// down like a pooling layer without `ceil_mode`
    pub fn output_dims(&self, height: usize, width: usize) -> Result<(usize, usize), Error> {
        self.check()?;

        let padded_h = height + 2 * self.padding.0;
        let padded_w = width + 2 * self.padding.1;

        if padded_h < self.kernel.0 || padded_w < self.kernel.1 {
            return Err(Error::InputTooSmall {
                height,
                width,
                kernel: self.kernel,
            });
        }

        Ok((
            (padded_h - self.kernel.0) / self.stride.0 + 1,
            (padded_w - self.kernel.1) / self.stride.1 + 1,
        ))
    }

    // maps an output position + kernel offset back to the (unpadded) input
    #[inline]
    fn source(&self, out: (usize, usize), k: (usize, usize), dims: (usize, usize)) -> Option<(usize, usize)> {
        let y = (out.0 * self.stride.0 + k.0).checked_sub(self.padding.0)?;
        let x = (out.1 * self.stride.1 + k.1).checked_sub(self.padding.1)?;

        if y < dims.0 && x < dims.1 {
            Some((y, x))
        } else {
            None
        }
    }
}

/// `a · b`, with the rows of `a` split across scoped worker threads
pub(crate) fn matmul(
    a: ArrayView2<'_, f32>,
    b: ArrayView2<'_, f32>,
    ctx: &ExecutionContext,
) -> Array2<f32> {
    let rows = a.nrows();
    let mut out = Array2::zeros((rows, b.ncols()));

    let n_workers = ctx.max_thread_count().min(rows);
    if n_workers <= 1 || rows * b.ncols() < PARALLEL_THRESHOLD {
        linalg::general_mat_mul(1.0, &a, &b, 0.0, &mut out);
        return out;
    }

    let chunk = (rows + n_workers - 1) / n_workers;
    let result = crossbeam_utils::thread::scope(|scope| {
        for (a_rows, mut out_rows) in a
            .axis_chunks_iter(Axis(0), chunk)
            .zip(out.axis_chunks_iter_mut(Axis(0), chunk))
        {
            scope.spawn(move |_| {
                linalg::general_mat_mul(1.0, &a_rows, &b, 0.0, &mut out_rows);
            });
        }
    });

    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }

    out
}

/// Unrolls every kernel-sized patch of `x` into a column, so a convolution
/// becomes a single matrix product
fn im2col(x: ArrayView3<'_, f32>, win: &Window, out_dims: (usize, usize)) -> Array2<f32> {
    let (channels, height, width) = x.dim();
    let (kh, kw) = win.kernel;
    let (ho, wo) = out_dims;

    let mut cols = Array2::zeros((channels * kh * kw, ho * wo));
    for c in 0..channels {
        for ky in 0..kh {
            for kx in 0..kw {
                let mut row = cols.row_mut((c * kh + ky) * kw + kx);
                for oy in 0..ho {
                    for ox in 0..wo {
                        if let Some((y, x_)) = win.source((oy, ox), (ky, kx), (height, width)) {
                            row[oy * wo + ox] = x[[c, y, x_]];
                        }
                    }
                }
            }
        }
    }

    cols
}

/// The adjoint of `im2col`, overlapping patches accumulate
fn col2im(cols: &Array2<f32>, win: &Window, out_dims: (usize, usize), mut dst: ArrayViewMut3<'_, f32>) {
    let (channels, height, width) = dst.dim();
    let (kh, kw) = win.kernel;
    let (ho, wo) = out_dims;

    for c in 0..channels {
        for ky in 0..kh {
            for kx in 0..kw {
                let row = cols.row((c * kh + ky) * kw + kx);
                for oy in 0..ho {
                    for ox in 0..wo {
                        if let Some((y, x)) = win.source((oy, ox), (ky, kx), (height, width)) {
                            dst[[c, y, x]] += row[oy * wo + ox];
                        }
                    }
                }
            }
        }
    }
}

/// 2D convolution. `weight` is the kernel already flattened to
/// `[out_channels, in_channels * kh * kw]`.
pub(crate) fn conv2d(
    x: &Tensor,
    weight: &Array2<f32>,
    bias: &Array1<f32>,
    win: &Window,
    ctx: &ExecutionContext,
) -> Result<Tensor, Error> {
    let (batch, _, height, width) = x.dim();
    let (ho, wo) = win.output_dims(height, width)?;
    let out_channels = weight.nrows();

    let mut out = Tensor::zeros((batch, out_channels, ho, wo));
    for b in 0..batch {
        let cols = im2col(x.index_axis(Axis(0), b), win, (ho, wo));
        let y = matmul(weight.view(), cols.view(), ctx);

        for ((o, p), v) in y.indexed_iter() {
            out[[b, o, p / wo, p % wo]] = v + bias[o];
        }
    }

    Ok(out)
}

/// Gradient of `conv2d` with respect to its input
pub(crate) fn conv2d_backward(
    x: &Tensor,
    weight: &Array2<f32>,
    win: &Window,
    grad: &Tensor,
    ctx: &ExecutionContext,
) -> Tensor {
    let (batch, out_channels, ho, wo) = grad.dim();
    let mut grad_in = Tensor::zeros(x.raw_dim());

    for b in 0..batch {
        let g = Array2::from_shape_fn((out_channels, ho * wo), |(o, p)| grad[[b, o, p / wo, p % wo]]);
        let cols = matmul(weight.t(), g.view(), ctx);
        col2im(&cols, win, (ho, wo), grad_in.index_axis_mut(Axis(0), b));
    }

    grad_in
}

/// Average pooling, padded positions count towards the divisor
pub(crate) fn avg_pool2d(x: &Tensor, win: &Window) -> Result<Tensor, Error> {
    let (batch, channels, height, width) = x.dim();
    let (ho, wo) = win.output_dims(height, width)?;
    let norm = (win.kernel.0 * win.kernel.1) as f32;

    let mut out = Tensor::zeros((batch, channels, ho, wo));
    for ((b, c, oy, ox), v) in out.indexed_iter_mut() {
        let mut sum = 0.0;
        for ky in 0..win.kernel.0 {
            for kx in 0..win.kernel.1 {
                if let Some((y, x_)) = win.source((oy, ox), (ky, kx), (height, width)) {
                    sum += x[[b, c, y, x_]];
                }
            }
        }
        *v = sum / norm;
    }

    Ok(out)
}

pub(crate) fn avg_pool2d_backward(x: &Tensor, win: &Window, grad: &Tensor) -> Tensor {
    let (_, _, height, width) = x.dim();
    let norm = (win.kernel.0 * win.kernel.1) as f32;

    let mut grad_in = Tensor::zeros(x.raw_dim());
    for ((b, c, oy, ox), g) in grad.indexed_iter() {
        for ky in 0..win.kernel.0 {
            for kx in 0..win.kernel.1 {
                if let Some((y, x_)) = win.source((oy, ox), (ky, kx), (height, width)) {
                    grad_in[[b, c, y, x_]] += g / norm;
                }
            }
        }
    }

    grad_in
}

// location of the maximum within a pooling window, padding never wins
fn window_argmax(x: &Tensor, win: &Window, b: usize, c: usize, out: (usize, usize)) -> Option<(usize, usize)> {
    let (_, _, height, width) = x.dim();
    let mut best: Option<((usize, usize), f32)> = None;

    for ky in 0..win.kernel.0 {
        for kx in 0..win.kernel.1 {
            if let Some((y, x_)) = win.source(out, (ky, kx), (height, width)) {
                let v = x[[b, c, y, x_]];
                match best {
                    Some((_, bv)) if bv >= v => {}
                    _ => best = Some(((y, x_), v)),
                }
            }
        }
    }

    best.map(|(pos, _)| pos)
}

pub(crate) fn max_pool2d(x: &Tensor, win: &Window) -> Result<Tensor, Error> {
    let (batch, channels, height, width) = x.dim();
    let (ho, wo) = win.output_dims(height, width)?;

    let mut out = Tensor::zeros((batch, channels, ho, wo));
    for ((b, c, oy, ox), v) in out.indexed_iter_mut() {
        *v = window_argmax(x, win, b, c, (oy, ox))
            .map(|(y, x_)| x[[b, c, y, x_]])
            .unwrap_or(f32::NEG_INFINITY);
    }

    Ok(out)
}

pub(crate) fn max_pool2d_backward(x: &Tensor, win: &Window, grad: &Tensor) -> Tensor {
    let mut grad_in = Tensor::zeros(x.raw_dim());
    for ((b, c, oy, ox), g) in grad.indexed_iter() {
        if let Some((y, x_)) = window_argmax(x, win, b, c, (oy, ox)) {
            grad_in[[b, c, y, x_]] += *g;
        }
    }

    grad_in
}

/// Flattens an activation of `[a, b, c, d]` into the `[a * b, c * d]`
/// feature matrix the Gram matrix is computed from
fn feature_matrix(x: &Tensor) -> Array2<f32> {
    let (a, b, c, d) = x.dim();
    Array2::from_shape_fn((a * b, c * d), |(r, p)| x[[r / b, r % b, p / d, p % d]])
}

/// The normalized Gram matrix of an activation: channel-pair inner products
/// divided by the total number of elements in the activation.
///
/// Because every pixel contributes to the same sums, the result is
/// symmetric and doesn't depend on the spatial arrangement of the pixels.
pub fn gram_matrix(x: &Tensor) -> Array2<f32> {
    let features = feature_matrix(x);
    let mut g = features.dot(&features.t());
    g /= x.len() as f32;
    g
}

/// Gradient of `gram_matrix` with respect to its input activation, given the
/// gradient with respect to the Gram matrix
pub fn gram_matrix_backward(x: &Tensor, grad: &Array2<f32>) -> Tensor {
    let features = feature_matrix(x);
    let sym = grad + &grad.t();
    let mut d_features = sym.dot(&features);
    d_features /= x.len() as f32;

    let (_, b, _, d) = x.dim();
    Tensor::from_shape_fn(x.dim(), |(i, j, y, x_)| d_features[[i * b + j, y * d + x_]])
}

/// Mean squared error between two arrays of identical shape
pub fn mse_loss<D: ndarray::Dimension>(
    input: &ndarray::Array<f32, D>,
    target: &ndarray::Array<f32, D>,
) -> f32 {
    let sum = Zip::from(input)
        .and(target)
        .fold(0.0f32, |acc, &x, &t| acc + (x - t) * (x - t));
    sum / input.len() as f32
}

/// Gradient of `mse_loss` with respect to `input`
pub fn mse_loss_backward<D: ndarray::Dimension>(
    input: &ndarray::Array<f32, D>,
    target: &ndarray::Array<f32, D>,
) -> ndarray::Array<f32, D> {
    let scale = 2.0 / input.len() as f32;
    Zip::from(input)
        .and(target)
        .map_collect(|&x, &t| (x - t) * scale)
}

/// Clamps every value into `[0, 1]`, the valid range of an image
#[inline]
pub fn clamp_unit(values: &mut [f32]) {
    for v in values {
        *v = v.clamp(0.0, 1.0);
    }
}

/// Rebuilds a tensor of shape `dim` from values in logical (row major) order
pub(crate) fn from_flat(dim: (usize, usize, usize, usize), values: &[f32]) -> Tensor {
    let (_, c, h, w) = dim;
    Tensor::from_shape_fn(dim, |(n, ch, y, x)| values[((n * c + ch) * h + y) * w + x])
}
