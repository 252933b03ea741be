//! Optimizer(s)

use crate::tensor::{Tensor, no_grad};

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with momentum. With a momentum of 0 this is plain gradient descent.
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        // the update itself is not part of the graph
        let _guard = no_grad();
        let (lr, momentum) = (self.lr, self.momentum);
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            param.update(|data, grad| {
                for ((p, v), g) in data.iter_mut().zip(velocity.iter_mut()).zip(grad) {
                    *v = momentum * *v - lr * g;
                    *p += *v;
                }
            });
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// The hand-written update: `p -= p.grad * lr` for every parameter, then zero its gradient
pub fn manual_sgd_step(params: &mut [Tensor], lr: f32) {
    let _guard = no_grad();
    for param in params.iter_mut() {
        param.update(|data, grad| {
            for (p, g) in data.iter_mut().zip(grad) {
                *p -= g * lr;
            }
        });
        param.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn params() -> (Tensor, Tensor) {
        let a = Tensor::new(vec![1.0], &[1]).unwrap().requires_grad_();
        let b = Tensor::new(vec![2.0, 3.0], &[2]).unwrap().requires_grad_();
        // a is broadcast over both elements of b: d c / da = 2 * 2, d c / db = 1
        let c = a.scale(2.0).add(&b).unwrap().sum();
        c.backward().unwrap();
        (a, b)
    }

    #[test]
    fn test_sgd_no_momentum() {
        let (a, b) = params();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad(), vec![4.0]);
        assert_eq_float!(a.data()[0], 0.6);
        assert_eq_float!(b.data()[0], 1.9);
        assert_eq_float!(b.data()[1], 2.9);
        assert!(optim.params()[0].ptr_eq(&a));
    }

    #[test]
    fn test_sgd_with_momentum() {
        let (a, b) = params();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.9);
        optim.step();
        assert_eq_float!(a.data()[0], 0.6);
        assert_eq_float!(optim.velocities()[0][0], -0.4);
        assert_eq_float!(b.data()[0], 1.9);
        assert_eq_float!(optim.velocities()[1][0], -0.1);
        optim.step();
        // v = 0.9 * -0.1 - 0.1 * 1
        assert_eq_float!(b.data()[0], 1.71);
        assert_eq_float!(optim.velocities()[1][1], -0.19);
        // v = 0.9 * -0.4 - 0.1 * 4
        assert_eq_float!(optim.velocities()[0][0], -0.76);
        assert_eq_float!(a.data()[0], -0.16);
    }

    #[test]
    fn test_zero_grad_twice() {
        let (a, b) = params();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.0);
        optim.zero_grad();
        assert_eq!(a.grad(), vec![0.0]);
        assert_eq!(b.grad(), vec![0.0, 0.0]);
        optim.zero_grad();
        assert_eq!(a.grad(), vec![0.0]);
        assert_eq!(b.grad(), vec![0.0, 0.0]);

        // no gradient, no movement
        optim.step();
        assert_eq!(a.data(), vec![1.0]);
    }

    #[test]
    fn test_manual_step() {
        let (a, b) = params();
        let mut params = vec![a.clone(), b.clone()];
        manual_sgd_step(&mut params, 0.5);
        assert_eq!(a.data(), vec![-1.0]);
        assert_eq!(b.data(), vec![1.5, 2.5]);
        assert_eq!(a.grad(), vec![0.0]);
        assert_eq!(b.grad(), vec![0.0, 0.0]);
        // grad mode is restored once the step is done
        assert!(crate::tensor::is_grad_enabled());
    }
}
