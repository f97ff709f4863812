use crate::{
    layers::{BatchNorm2d, Conv2d, Layer},
    Error,
};
use ndarray::{Array1, Array4};
use safetensors::{Dtype, SafeTensors};
use std::{path::Path, str::FromStr};

/// Marks a 2x2 max pool in a VGG layer configuration, every other entry is
/// the output channel count of a 3x3 convolution
pub const POOL: usize = 0;

const VGG11: &[usize] = &[64, POOL, 128, POOL, 256, 256, POOL, 512, 512, POOL, 512, 512, POOL];
const VGG13: &[usize] = &[
    64, 64, POOL, 128, 128, POOL, 256, 256, POOL, 512, 512, POOL, 512, 512, POOL,
];
const VGG16: &[usize] = &[
    64, 64, POOL, 128, 128, POOL, 256, 256, 256, POOL, 512, 512, 512, POOL, 512, 512, 512, POOL,
];
const VGG19: &[usize] = &[
    64, 64, POOL, 128, 128, POOL, 256, 256, 256, 256, POOL, 512, 512, 512, 512, POOL, 512, 512,
    512, 512, POOL,
];

const BATCH_NORM_EPS: f32 = 1e-5;

/// The depth of a VGG feature stack
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VggDepth {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
}

/// A pretrained backbone architecture whose weights can be loaded from disk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Architecture {
    pub depth: VggDepth,
    pub batch_norm: bool,
}

impl Architecture {
    pub fn vgg19() -> Self {
        Self {
            depth: VggDepth::Vgg19,
            batch_norm: false,
        }
    }

    /// The layer configuration, see [`POOL`]
    pub fn config(&self) -> &'static [usize] {
        match self.depth {
            VggDepth::Vgg11 => VGG11,
            VggDepth::Vgg13 => VGG13,
            VggDepth::Vgg16 => VGG16,
            VggDepth::Vgg19 => VGG19,
        }
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Self::vgg19()
    }
}

impl FromStr for Architecture {
    type Err = Error;

    /// Parses names like `vgg19` or `vgg16-bn`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (name, batch_norm) = match lower
            .strip_suffix("-bn")
            .or_else(|| lower.strip_suffix("_bn"))
        {
            Some(name) => (name, true),
            None => (lower.as_str(), false),
        };

        let depth = match name {
            "vgg11" => VggDepth::Vgg11,
            "vgg13" => VggDepth::Vgg13,
            "vgg16" => VggDepth::Vgg16,
            "vgg19" => VggDepth::Vgg19,
            _ => return Err(Error::UnknownArchitecture(s.to_owned())),
        };

        Ok(Self { depth, batch_norm })
    }
}

/// A frozen, pretrained convolutional network, as a linear sequence of
/// layers. The model assembler only ever reads a backbone, cloning it when
/// it needs its own copy.
#[derive(Clone, Debug)]
pub struct Backbone {
    layers: Vec<Layer>,
}

impl Backbone {
    /// Creates a backbone from a sequence of layers
    pub fn new<I>(layers: I) -> Self
    where
        I: IntoIterator<Item = Layer>,
    {
        Self {
            layers: layers.into_iter().collect(),
        }
    }

    /// Loads the weights for `arch` from a safetensors file
    pub fn load<P: AsRef<Path>>(arch: Architecture, path: P) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Self::from_safetensors(arch.config(), arch.batch_norm, &bytes)
    }

    /// Builds a VGG-style feature stack from a layer configuration and
    /// serialized safetensors weights.
    ///
    /// Weights are looked up with the torchvision naming scheme, where each
    /// layer is keyed by its index in the `features` sequence, eg
    /// `features.0.weight`, `features.0.bias`, and for batch normalization
    /// layers also `features.1.running_mean` and `features.1.running_var`.
    /// Activations are in-place ReLUs, just like the reference model.
    pub fn from_safetensors(config: &[usize], batch_norm: bool, weights: &[u8]) -> Result<Self, Error> {
        let tensors = SafeTensors::deserialize(weights)?;

        let mut layers = Vec::with_capacity(config.len() * 3);
        let mut in_channels = 3;

        for &entry in config {
            if entry == POOL {
                layers.push(Layer::max_pool());
                continue;
            }

            let index = layers.len();
            let weight = read_tensor(&tensors, &format!("features.{}.weight", index), &[entry, in_channels, 3, 3])?;
            let bias = read_tensor(&tensors, &format!("features.{}.bias", index), &[entry])?;

            let weight = Array4::from_shape_vec((entry, in_channels, 3, 3), weight).map_err(|_| {
                Error::WeightShape {
                    key: format!("features.{}.weight", index),
                    expected: vec![entry, in_channels, 3, 3],
                    found: vec![],
                }
            })?;
            layers.push(Layer::Conv2d(Conv2d::new(weight, Array1::from(bias), 1, 1)?));

            if batch_norm {
                let index = layers.len();
                let read = |name: &str| {
                    read_tensor(&tensors, &format!("features.{}.{}", index, name), &[entry])
                        .map(Array1::from)
                };

                let bn = BatchNorm2d::new(
                    read("weight")?,
                    read("bias")?,
                    read("running_mean")?,
                    read("running_var")?,
                    BATCH_NORM_EPS,
                )?;
                layers.push(Layer::BatchNorm2d(bn));
            }

            layers.push(Layer::Relu { inplace: true });
            in_channels = entry;
        }

        log::debug!("loaded a backbone of {} layers", layers.len());

        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

fn read_tensor(tensors: &SafeTensors<'_>, key: &str, shape: &[usize]) -> Result<Vec<f32>, Error> {
    let view = tensors.tensor(key)?;

    if view.dtype() != Dtype::F32 {
        return Err(Error::UnsupportedWeightType {
            key: key.to_owned(),
            dtype: format!("{:?}", view.dtype()),
        });
    }

    if view.shape() != shape {
        return Err(Error::WeightShape {
            key: key.to_owned(),
            expected: shape.to_vec(),
            found: view.shape().to_vec(),
        });
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use safetensors::tensor::TensorView;

    fn to_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
    }

    // serializes a tensor per (key, shape), filled with a constant
    fn weights(entries: &[(&str, Vec<usize>)]) -> Vec<u8> {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = entries
            .iter()
            .map(|(key, shape)| {
                let len: usize = shape.iter().product();
                (key.to_string(), shape.clone(), to_bytes(&vec![0.5; len]))
            })
            .collect();

        let views: Vec<(String, TensorView<'_>)> = buffers
            .iter()
            .map(|(key, shape, data)| {
                (
                    key.clone(),
                    TensorView::new(Dtype::F32, shape.clone(), data).unwrap(),
                )
            })
            .collect();

        safetensors::serialize(views, &None).unwrap()
    }

    #[test]
    fn parses_architectures() {
        assert_eq!("vgg19".parse::<Architecture>().unwrap(), Architecture::vgg19());

        let bn: Architecture = "VGG16-bn".parse().unwrap();
        assert_eq!(bn.depth, VggDepth::Vgg16);
        assert!(bn.batch_norm);

        assert!("resnet50".parse::<Architecture>().is_err());
    }

    #[test]
    fn vgg19_has_sixteen_convolutions() {
        let convs = Architecture::vgg19().config().iter().filter(|&&c| c != POOL).count();
        assert_eq!(convs, 16);
    }

    #[test]
    fn loads_torchvision_layout() {
        let bytes = weights(&[
            ("features.0.weight", vec![4, 3, 3, 3]),
            ("features.0.bias", vec![4]),
            ("features.3.weight", vec![2, 4, 3, 3]),
            ("features.3.bias", vec![2]),
        ]);

        let backbone = Backbone::from_safetensors(&[4, POOL, 2], false, &bytes).unwrap();
        let names: Vec<_> = backbone.layers().iter().map(|l| l.type_name()).collect();
        assert_eq!(names, ["Conv2d", "ReLU", "MaxPool2d", "Conv2d", "ReLU"]);
        assert!(backbone.layers()[1].is_inplace());

        match &backbone.layers()[3] {
            Layer::Conv2d(conv) => {
                assert_eq!(conv.in_channels(), 4);
                assert_eq!(conv.out_channels(), 2);
            }
            other => panic!("expected a convolution, got {}", other),
        }
    }

    #[test]
    fn loads_batch_norm_layers() {
        let bytes = weights(&[
            ("features.0.weight", vec![2, 3, 3, 3]),
            ("features.0.bias", vec![2]),
            ("features.1.weight", vec![2]),
            ("features.1.bias", vec![2]),
            ("features.1.running_mean", vec![2]),
            ("features.1.running_var", vec![2]),
        ]);

        let backbone = Backbone::from_safetensors(&[2, POOL], true, &bytes).unwrap();
        let names: Vec<_> = backbone.layers().iter().map(|l| l.type_name()).collect();
        assert_eq!(names, ["Conv2d", "BatchNorm2d", "ReLU", "MaxPool2d"]);
    }

    #[test]
    fn rejects_wrong_shapes() {
        let bytes = weights(&[
            ("features.0.weight", vec![4, 1, 3, 3]),
            ("features.0.bias", vec![4]),
        ]);

        match Backbone::from_safetensors(&[4], false, &bytes) {
            Err(Error::WeightShape { key, found, .. }) => {
                assert_eq!(key, "features.0.weight");
                assert_eq!(found, vec![4, 1, 3, 3]);
            }
            other => panic!("expected a shape error, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn missing_weights_are_an_error() {
        let bytes = weights(&[("features.0.weight", vec![4, 3, 3, 3])]);
        assert!(matches!(
            Backbone::from_safetensors(&[4], false, &bytes),
            Err(Error::Weights(_))
        ));
    }
}
