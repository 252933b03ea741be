//! A minimal tensor library with reverse-mode autograd, used to train MNIST
//! classifiers through a PyTorch-like API.

pub mod backprop_fns;
pub mod dataloader;
pub mod loss;
pub mod mnist;
pub mod models;
pub mod nn;
pub mod optim;
pub mod pickle;
pub mod plot;
pub mod tensor;
pub mod train;
