//! Loss taps, stages that are injected into a pipeline to measure how far the
//! activations at their depth are from a fixed target.
//!
//! A tap's forward pass is the identity: it only records the loss of the
//! activation flowing through it so the optimizer loop can read it back.

use crate::tensor::{self, Tensor};
use ndarray::Array2;

/// Measures how much the activation at some depth differs from the content
/// image's activation at that same depth.
#[derive(Clone, Debug)]
pub struct ContentLoss {
    target: Tensor,
    loss: f32,
}

impl ContentLoss {
    /// Captures `target` as the constant this tap compares against
    pub fn new(target: Tensor) -> Self {
        Self { target, loss: 0.0 }
    }

    pub fn target(&self) -> &Tensor {
        &self.target
    }

    /// The loss recorded by the most recent forward pass
    #[inline]
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn forward<'a>(&mut self, input: &'a Tensor) -> &'a Tensor {
        self.loss = tensor::mse_loss(input, &self.target);
        input
    }

    /// Gradient of this tap's loss with respect to the activation it measured
    pub fn backward(&self, input: &Tensor) -> Tensor {
        tensor::mse_loss_backward(input, &self.target)
    }
}

/// Measures how much the texture statistics (Gram matrix) of the activation
/// at some depth differ from the style image's.
#[derive(Clone, Debug)]
pub struct StyleLoss {
    target: Array2<f32>,
    loss: f32,
}

impl StyleLoss {
    /// Captures the Gram matrix of `target_feature` as the constant this tap
    /// compares against
    pub fn new(target_feature: &Tensor) -> Self {
        Self {
            target: tensor::gram_matrix(target_feature),
            loss: 0.0,
        }
    }

    pub fn target(&self) -> &Array2<f32> {
        &self.target
    }

    /// The loss recorded by the most recent forward pass
    #[inline]
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn forward<'a>(&mut self, input: &'a Tensor) -> &'a Tensor {
        let g = tensor::gram_matrix(input);
        self.loss = tensor::mse_loss(&g, &self.target);
        input
    }

    /// Gradient of this tap's loss with respect to the activation it measured
    pub fn backward(&self, input: &Tensor) -> Tensor {
        let g = tensor::gram_matrix(input);
        let d_gram = tensor::mse_loss_backward(&g, &self.target);
        tensor::gram_matrix_backward(input, &d_gram)
    }
}
