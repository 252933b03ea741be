//! The MNIST classifiers, from a bare logistic regression to convolutional stacks

use rand::Rng;

use crate::{
    dataloader::Batch,
    nn::{AdaptiveAvgPool2d, AvgPool2d, Conv2d, Lambda, Linear, Module, NNError, ReLU, Sequential},
    tensor::{Tensor, TensorError},
};

/// Flattened 28x28 images
pub const N_PIXELS: usize = 784;
pub const IMAGE_SIDE: usize = 28;
pub const N_CLASSES: usize = 10;

/// Logistic regression over raw parameter tensors
pub struct MnistLogistic {
    pub weights: Tensor,
    pub bias: Tensor,
}

impl MnistLogistic {
    /// Xavier style initialisation: standard normal weights scaled by `1 / sqrt(784)`, zero bias
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let weights = Tensor::randn(&[N_PIXELS, N_CLASSES], rng).scale(1.0 / (N_PIXELS as f32).sqrt());
        Self::from_parameters(weights, Tensor::zeros(&[N_CLASSES]))
    }

    pub fn from_parameters(weights: Tensor, bias: Tensor) -> Self {
        Self {
            weights: weights.requires_grad_(),
            bias: bias.requires_grad_(),
        }
    }
}

impl Module for MnistLogistic {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.matmul(&self.weights)?.add(&self.bias)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

/// Logistic regression through a [`Linear`] layer
pub struct MnistLinear {
    lin: Linear,
}

impl MnistLinear {
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        Self {
            lin: Linear::new(N_PIXELS, N_CLASSES, rng),
        }
    }
}

impl Module for MnistLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.lin.forward(input)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.lin.parameters()
    }
}

/// Three strided convolutions, each halving the image: 28 -> 14 -> 7 -> 4, then a 4x4
/// average pool leaves one score per class
pub struct MnistCnn {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
}

impl MnistCnn {
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        Self {
            conv1: Conv2d::new(1, 16, 3, 2, 1, rng),
            conv2: Conv2d::new(16, 16, 3, 2, 1, rng),
            conv3: Conv2d::new(16, N_CLASSES, 3, 2, 1, rng),
        }
    }
}

impl Module for MnistCnn {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let xb = to_images(input)?;
        let xb = self.conv1.forward(&xb)?.relu();
        let xb = self.conv2.forward(&xb)?.relu();
        let xb = self.conv3.forward(&xb)?.relu();
        let xb = xb.avg_pool2d(4)?;
        Ok(flatten(&xb)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        [&self.conv1, &self.conv2, &self.conv3]
            .iter()
            .flat_map(|c| c.parameters())
            .collect()
    }
}

/// Reshapes flat pixel rows into `[batch, 1, 28, 28]` images
pub fn to_images(x: &Tensor) -> Result<Tensor, TensorError> {
    let side = IMAGE_SIDE as isize;
    x.view(&[-1, 1, side, side])
}

/// Collapses everything but the leading dimension
pub fn flatten(x: &Tensor) -> Result<Tensor, TensorError> {
    x.view(&[x.len() as isize, -1])
}

/// Batch transform for [`crate::dataloader::WrappedDataLoader`]: features become images
pub fn preprocess((x, y): Batch) -> Result<Batch, TensorError> {
    Ok((to_images(&x)?, y))
}

/// [`MnistCnn`] expressed as a [`Sequential`] with [`Lambda`] layers for the reshapes
pub fn sequential_cnn<R: Rng>(rng: &mut R) -> Sequential {
    Sequential::new(vec![])
        .add(Lambda::new(to_images))
        .add(Conv2d::new(1, 16, 3, 2, 1, rng))
        .add(ReLU::new())
        .add(Conv2d::new(16, 16, 3, 2, 1, rng))
        .add(ReLU::new())
        .add(Conv2d::new(16, N_CLASSES, 3, 2, 1, rng))
        .add(ReLU::new())
        .add(AvgPool2d::new(4))
        .add(Lambda::new(flatten))
}

/// Convolutional stack over batches which are already images (see [`preprocess`]).
/// The adaptive pool makes it independent of the image size.
pub fn sequential_cnn_adaptive<R: Rng>(rng: &mut R) -> Sequential {
    Sequential::new(vec![])
        .add(Conv2d::new(1, 16, 3, 2, 1, rng))
        .add(ReLU::new())
        .add(Conv2d::new(16, 16, 3, 2, 1, rng))
        .add(ReLU::new())
        .add(Conv2d::new(16, N_CLASSES, 3, 2, 1, rng))
        .add(AdaptiveAvgPool2d::new(1))
        .add(Lambda::new(flatten))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn batch(n: usize) -> Tensor {
        let data = (0..n * N_PIXELS).map(|i| (i % 255) as f32 / 255.0).collect();
        Tensor::new(data, &[n, N_PIXELS]).unwrap()
    }

    #[test]
    fn test_logistic() {
        let model = MnistLogistic::new(&mut Pcg64Mcg::seed_from_u64(0));
        assert_eq!(model.forward(&batch(3)).unwrap().shape(), vec![3, N_CLASSES]);
        assert_eq!(model.parameters().len(), 2);
        assert!(model.parameters().iter().all(Tensor::requires_grad));
        assert_eq!(model.bias.data(), vec![0.0; N_CLASSES]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let model = MnistLinear::new(&mut Pcg64Mcg::seed_from_u64(0));
        assert_eq!(model.forward(&batch(2)).unwrap().shape(), vec![2, N_CLASSES]);
        let wrong = Tensor::zeros(&[2, 100]);
        assert!(matches!(
            model.forward(&wrong),
            Err(NNError::InputSizeMismatch {
                expected: N_PIXELS,
                got: 100
            })
        ));
    }

    #[test]
    fn test_cnn_variants_agree_on_shape() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let x = batch(2);

        let cnn = MnistCnn::new(&mut rng);
        assert_eq!(cnn.forward(&x).unwrap().shape(), vec![2, N_CLASSES]);
        assert_eq!(cnn.parameters().len(), 6);

        let seq = sequential_cnn(&mut rng);
        assert_eq!(seq.forward(&x).unwrap().shape(), vec![2, N_CLASSES]);
        assert_eq!(seq.parameters().len(), 6);

        let adaptive = sequential_cnn_adaptive(&mut rng);
        let (images, _) = preprocess((x, Tensor::zeros(&[2]))).unwrap();
        assert_eq!(images.shape(), vec![2, 1, IMAGE_SIDE, IMAGE_SIDE]);
        assert_eq!(adaptive.forward(&images).unwrap().shape(), vec![2, N_CLASSES]);
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let a = MnistCnn::new(&mut Pcg64Mcg::seed_from_u64(11));
        let b = MnistCnn::new(&mut Pcg64Mcg::seed_from_u64(11));
        for (p, q) in a.parameters().iter().zip(b.parameters().iter()) {
            assert_eq!(p, q);
            assert!(!p.ptr_eq(q));
        }
    }

    #[test]
    fn test_cnn_backward_reaches_every_parameter() {
        let model = sequential_cnn_adaptive(&mut Pcg64Mcg::seed_from_u64(5));
        let targets = Tensor::new(vec![3.0, 7.0], &[2]).unwrap();
        let images = to_images(&batch(2)).unwrap();
        let loss = crate::loss::cross_entropy(&model.forward(&images).unwrap(), &targets).unwrap();
        loss.backward().unwrap();
        for p in model.parameters() {
            assert_eq!(p.grad().len(), p.numel());
            assert!(p.grad().iter().all(|g| g.is_finite()));
        }
        // the output layer bias always receives gradient from the softmax
        assert!(model.parameters()[5].grad().iter().any(|&g| g != 0.0));
    }
}
