use crate::{tensor::Tensor, Error};
use ndarray::{Array1, Axis};

/// The channel means of the ImageNet training set, which every torchvision
/// backbone expects its input to be standardized with
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// The channel standard deviations of the ImageNet training set
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel standardization, `(img - mean) / std`, applied as the very
/// first stage of a pipeline so that `[0, 1]` images match the distribution
/// the backbone was trained on.
#[derive(Clone, Debug, PartialEq)]
pub struct Normalization {
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl Normalization {
    pub fn new(mean: &[f32], std: &[f32]) -> Result<Self, Error> {
        if mean.len() != std.len() {
            return Err(Error::Normalization(format!(
                "{} means were provided, but {} standard deviations were",
                mean.len(),
                std.len()
            )));
        }

        if let Some(bad) = std.iter().find(|s| !s.is_finite() || **s == 0.0) {
            return Err(Error::Normalization(format!(
                "standard deviation '{}' must be finite and non-zero",
                bad
            )));
        }

        Ok(Self {
            mean: Array1::from(mean.to_vec()),
            std: Array1::from(std.to_vec()),
        })
    }

    pub fn imagenet() -> Self {
        Self {
            mean: Array1::from(IMAGENET_MEAN.to_vec()),
            std: Array1::from(IMAGENET_STD.to_vec()),
        }
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    fn check_channels(&self, x: &Tensor) -> Result<(), Error> {
        let channels = x.dim().1;
        if channels != self.channels() {
            return Err(Error::Normalization(format!(
                "the image has {} channels, but the constants are for {}",
                channels,
                self.channels()
            )));
        }
        Ok(())
    }

    pub fn forward(&self, img: &Tensor) -> Result<Tensor, Error> {
        self.check_channels(img)?;

        let mut out = img.clone();
        for (c, mut channel) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            channel.mapv_inplace(|v| (v - mean) / std);
        }

        Ok(out)
    }

    /// The gradient with respect to the raw image, given the gradient with
    /// respect to the normalized one
    pub fn backward(&self, mut grad: Tensor) -> Result<Tensor, Error> {
        self.check_channels(&grad)?;

        for (c, mut channel) in grad.axis_iter_mut(Axis(1)).enumerate() {
            channel /= self.std[c];
        }

        Ok(grad)
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::imagenet()
    }
}
