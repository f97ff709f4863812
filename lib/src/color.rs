//! Color pre-matching, recolors the style image with the color statistics of
//! the content image before any optimization happens, so the result keeps
//! the content's palette while picking up the style's textures.

use crate::tensor::Tensor;
use ndarray::{Array1, Array2, Axis};

// eigenvalues are floored at this so flat color channels can be whitened
const EIGEN_FLOOR: f64 = 1e-5;
const JACOBI_SWEEPS: usize = 64;

/// Recolors `style` so that its channel covariance matches the covariance of
/// `content`, then moves its channel means halfway towards the content's.
///
/// `new_style = C_c^½ · C_s^-½ · style + ½ (μ_c - μ(C_c^½ · C_s^-½ · style))`
///
/// Only the first image of each batch is used, the output has the shape of
/// `style`. The images may have different spatial dimensions.
pub fn match_colors(content: &Tensor, style: &Tensor) -> Tensor {
    let content_px = pixels(content);
    let style_px = pixels(style);

    let (_, content_cov) = mean_and_covariance(&content_px);
    let (_, style_cov) = mean_and_covariance(&style_px);

    let transform = sym_pow(&content_cov, 0.5).dot(&sym_pow(&style_cov, -0.5));
    let mut recolored = transform.dot(&style_px);

    let adjustment = content_px.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(3))
        - recolored.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(3));

    for (mut channel, shift) in recolored.outer_iter_mut().zip(adjustment.iter()) {
        channel += 0.5 * shift;
    }

    let (_, channels, height, width) = style.dim();
    Tensor::from_shape_fn((1, channels, height, width), |(_, c, y, x)| {
        recolored[[c, y * width + x]] as f32
    })
}

// [channels, height * width] of the first image
fn pixels(t: &Tensor) -> Array2<f64> {
    let (_, channels, height, width) = t.dim();
    Array2::from_shape_fn((channels, height * width), |(c, p)| {
        f64::from(t[[0, c, p / width, p % width]])
    })
}

/// Channel means and the unbiased channel covariance of `[channels, n]`
/// samples
fn mean_and_covariance(px: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let (channels, n) = px.dim();
    let mean = px.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(channels));

    let mut centered = px.clone();
    for (mut row, m) in centered.outer_iter_mut().zip(mean.iter()) {
        row -= *m;
    }

    let mut cov = centered.dot(&centered.t());
    cov /= (n.max(2) - 1) as f64;

    (mean, cov)
}

/// `V · diag(max(λ, ε)^p) · Vᵀ` for a symmetric matrix
fn sym_pow(m: &Array2<f64>, p: f64) -> Array2<f64> {
    let (values, vectors) = jacobi_eigen(m);
    let scaled = Array1::from_iter(values.iter().map(|v| v.max(EIGEN_FLOOR).powf(p)));

    let mut vd = vectors.clone();
    for (mut col, s) in vd.axis_iter_mut(Axis(1)).zip(scaled.iter()) {
        col *= *s;
    }

    vd.dot(&vectors.t())
}

/// Eigen decomposition of a small symmetric matrix with cyclic Jacobi
/// rotations. Returns the eigenvalues and the eigenvectors as columns.
fn jacobi_eigen(m: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = m.nrows();
    let mut a = m.clone();
    let mut v = Array2::eye(n);

    for _ in 0..JACOBI_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .map(|(i, j)| a[[i, j]] * a[[i, j]])
            .sum();

        if off < 1e-22 {
            break;
        }

        for p in 0..n {
            for q in p + 1..n {
                if a[[p, q]].abs() < 1e-300 {
                    continue;
                }

                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                // A <- Jᵀ A J
                for k in 0..n {
                    let (akp, akq) = (a[[k, p]], a[[k, q]]);
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let (apk, aqk) = (a[[p, k]], a[[q, k]]);
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let (vkp, vkq) = (v[[k, p]], v[[k, q]]);
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    (a.diag().to_owned(), v)
}
