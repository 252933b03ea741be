//! Components to build a neural network

use std::{
    fmt,
    sync::atomic::{self, AtomicUsize},
};

use rand::Rng;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError>;

    /// Every parameter owned by the module, including those of sub-modules
    fn parameters(&self) -> Vec<Tensor>;

    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    /// Switches between training and evaluation behaviour. None of the layers here
    /// behave differently, containers only propagate the flag.
    fn set_training(&mut self, _training: bool) {}

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }
}

/// Affine layer `x @ weight + bias` with `weight: [in, out]`
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new<R: Rng>(n_inputs: usize, n_outputs: usize, rng: &mut R) -> Self {
        // uniform in +-1/sqrt(fan_in), the default of torch.nn.Linear
        let bound = 1.0 / (n_inputs as f32).sqrt();
        Self::from_parameters(
            Tensor::uniform(&[n_inputs, n_outputs], bound, rng),
            Tensor::uniform(&[n_outputs], bound, rng),
        )
    }

    pub fn from_parameters(weight: Tensor, bias: Tensor) -> Self {
        Self {
            weight: weight.requires_grad_(),
            bias: bias.requires_grad_(),
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Number of NaN outputs in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let got = input.shape().last().copied().unwrap_or(0);
        if got != self.n_inputs() {
            return Err(NNError::InputSizeMismatch {
                expected: self.n_inputs(),
                got,
            });
        }
        let output = input.matmul(&self.weight)?.add(&self.bias)?;
        let n_output_nans = output.count_where(f32::is_nan);
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("n_output_nans: {}", n_output_nans);
        }
        Ok(output)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// 2-D convolution over NCHW batches with a square kernel
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Tensor,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let bound = 1.0 / (fan_in as f32).sqrt();
        Self {
            weight: Tensor::uniform(
                &[out_channels, in_channels, kernel_size, kernel_size],
                bound,
                rng,
            )
            .requires_grad_(),
            bias: Tensor::uniform(&[out_channels], bound, rng).requires_grad_(),
            stride,
            padding,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let shape = input.shape();
        if shape.len() == 4 && shape[1] != self.in_channels() {
            return Err(NNError::InputSizeMismatch {
                expected: self.in_channels(),
                got: shape[1],
            });
        }
        Ok(input.conv2d(&self.weight, &self.bias, self.stride, self.padding)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Applies ReLU element-wise, works for arbitrary shapes
#[derive(Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Returns the number of non-positive activations in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.count_where(|v| v <= 0.0);
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        Ok(input.relu())
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Average pooling over non-overlapping square windows
pub struct AvgPool2d {
    kernel_size: usize,
}

impl AvgPool2d {
    pub fn new(kernel_size: usize) -> Self {
        Self { kernel_size }
    }
}

impl Module for AvgPool2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.avg_pool2d(self.kernel_size)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Average pooling to a fixed `output_size x output_size` grid whatever the input size
pub struct AdaptiveAvgPool2d {
    output_size: usize,
}

impl AdaptiveAvgPool2d {
    pub fn new(output_size: usize) -> Self {
        Self { output_size }
    }
}

impl Module for AdaptiveAvgPool2d {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok(input.adaptive_avg_pool2d(self.output_size, self.output_size)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

type LambdaFn = dyn Fn(&Tensor) -> Result<Tensor, TensorError>;

/// Wraps an arbitrary function as a parameterless layer so it fits in a [`Sequential`]
pub struct Lambda {
    func: Box<LambdaFn>,
}

impl Lambda {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&Tensor) -> Result<Tensor, TensorError> + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

impl Module for Lambda {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        Ok((self.func)(input)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// Runs its layers in order, feeding each output into the next layer
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    training: bool,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self {
            layers,
            training: true,
        }
    }

    /// Appends a layer
    pub fn add<M: Module + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor, NNError> {
        self.layers
            .iter()
            .try_fold(input.clone(), |x, layer| layer.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }
}

impl fmt::Debug for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequential")
            .field("layers", &self.layers.len())
            .field("n_parameters", &self.parameters().len())
            .field("training", &self.training)
            .finish()
    }
}
