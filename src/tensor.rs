//! N-dimensional `f32` tensors which form a computation graph
//!
//! Every tensor is a shared node. Operations on tensors that require a gradient record
//! their inputs, so calling [`Tensor::backward`] on a scalar result accumulates gradients
//! into every tensor it was derived from. Recording can be suspended on the current thread
//! with [`no_grad`].
use std::{
    cell::{Cell, Ref, RefCell},
    collections::HashSet,
    fmt::{self, Display},
    ops::{Neg, Range},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::backprop_fns::{BackpropFunc, input_gradients};

/// Errors for tensor operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("Invalid shape: expected {expected}, got {got:?}")]
    InvalidShape { expected: String, got: Vec<usize> },
    #[error("Cannot view a tensor of shape {from:?} as {to:?}")]
    InvalidView { from: Vec<usize>, to: Vec<isize> },
    #[error("Invalid argument to {op}: {reason}")]
    InvalidArgument {
        op: &'static str,
        reason: &'static str,
    },
    #[error("Expected a single element tensor, got shape {shape:?}")]
    NotScalar { shape: Vec<usize> },
    #[error("Target {target} is not a class index in [0, {classes})")]
    InvalidTarget { target: f32, classes: usize },
    #[error("Empty batch")]
    EmptyBatch,
    #[error("Index {index} out of bounds for dimension of size {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Returns whether operations currently record the computation graph on this thread
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Suspends graph recording until the returned guard is dropped.
/// Analogous to `torch.no_grad()`. Guards nest, dropping one restores the previous state.
pub fn no_grad() -> NoGradGuard {
    let prev = GRAD_ENABLED.with(|enabled| enabled.replace(false));
    NoGradGuard { prev }
}

/// Restores the previous grad mode when dropped, see [`no_grad`]
#[must_use = "graph recording resumes as soon as the guard is dropped"]
pub struct NoGradGuard {
    prev: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|enabled| enabled.set(self.prev));
    }
}

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Newtype representing a shared tensor in a computation graph.
/// Cloning is cheap and keeps the identity of the underlying tensor.
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

impl Tensor {
    /// Create a new tensor from row-major data, not derived from any other tensors
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(TensorError::InvalidShape {
                expected: format!("{} elements", data.len()),
                got: shape.to_vec(),
            });
        }
        Ok(Self::from_parts(data, shape.to_vec()))
    }

    /// A zero dimensional tensor holding a single value
    pub fn scalar(value: f32) -> Self {
        Self::from_parts(vec![value], vec![])
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::from_parts(vec![0.0; shape.iter().product()], shape.to_vec())
    }

    /// Samples every element from the standard normal distribution
    pub fn randn<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let numel = shape.iter().product();
        let data = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
        Self::from_parts(data, shape.to_vec())
    }

    /// Samples every element uniformly from `[-bound, bound]`
    pub fn uniform<R: Rng>(shape: &[usize], bound: f32, rng: &mut R) -> Self {
        let numel = shape.iter().product();
        let data = (0..numel)
            .map(|_| rng.random_range(-bound..=bound))
            .collect();
        Self::from_parts(data, shape.to_vec())
    }

    fn from_parts(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(data, shape))))
    }

    /// Create a tensor derived from an operation on `inputs`. The graph edge is only
    /// recorded if grad mode is on and some input requires a gradient.
    fn derived(data: Vec<f32>, shape: Vec<usize>, backprop_fn: BackpropFunc, inputs: &[&Tensor]) -> Self {
        debug_assert_eq!(backprop_fn.n_operands(), inputs.len());
        let result = Self::from_parts(data, shape);
        if is_grad_enabled() && inputs.iter().any(|t| t.requires_grad()) {
            let mut inner = result.0.borrow_mut();
            inner.requires_grad = true;
            inner.backprop_fn = Some(backprop_fn);
            inner.children = inputs.iter().map(|t| t.0.clone()).collect();
        }
        result
    }

    pub fn data(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    /// Number of elements satisfying `pred`, without copying the data
    pub fn count_where<F: Fn(f32) -> bool>(&self, pred: F) -> usize {
        self.0.borrow().data.iter().filter(|&&v| pred(v)).count()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    /// Length of the leading dimension, 1 for a scalar
    pub fn len(&self) -> usize {
        self.0.borrow().shape.first().copied().unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// The accumulated gradient, zeros if nothing has been accumulated yet
    pub fn grad(&self) -> Vec<f32> {
        let inner = self.0.borrow();
        inner
            .grad
            .clone()
            .unwrap_or_else(|| vec![0.0; inner.data.len()])
    }

    /// The value of a single element tensor
    pub fn item(&self) -> Result<f32, TensorError> {
        let inner = self.0.borrow();
        match inner.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::NotScalar {
                shape: inner.shape.clone(),
            }),
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    /// Marks the tensor as a parameter whose gradient is tracked
    pub fn requires_grad_(self) -> Self {
        self.0.borrow_mut().requires_grad = true;
        self
    }

    /// Whether both handles point to the same tensor
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Mutates the data in place given the current gradient (zeros if none accumulated).
    /// The tensor keeps its identity, so every module holding it observes the update.
    pub fn update<F: FnOnce(&mut [f32], &[f32])>(&mut self, f: F) {
        let mut inner = self.0.borrow_mut();
        let InnerTensor { data, grad, .. } = &mut *inner;
        let zeros;
        let grad = match grad {
            Some(grad) => grad.as_slice(),
            None => {
                zeros = vec![0.0; data.len()];
                zeros.as_slice()
            }
        };
        f(data, grad);
    }

    /// Resets the gradient accumulator of this tensor to zeros.
    /// Unlike the scalar engine this only touches the tensor itself: intermediate nodes
    /// are rebuilt by every forward pass, so only leaves carry gradients across batches.
    pub fn zero_grad(&mut self) {
        let mut inner = self.0.borrow_mut();
        let n = inner.data.len();
        inner.grad = Some(vec![0.0; n]);
    }

    /// A new leaf tensor holding a copy of the data
    pub fn detach(&self) -> Tensor {
        let inner = self.0.borrow();
        Self::from_parts(inner.data.clone(), inner.shape.clone())
    }

    /// Backpropagates from this single element tensor, accumulating gradients into every
    /// tensor of the graph which requires one
    pub fn backward(&self) -> Result<(), TensorError> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.data.len() != 1 {
                return Err(TensorError::NotScalar {
                    shape: inner.shape.clone(),
                });
            }
            // d out / d out = 1
            inner.grad = Some(vec![1.0]);
        }

        let mut backprop_order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();

        // visit in post order
        self.backward_inner(&mut backprop_order, &mut visited);

        // apply backprop, reversed to start from root first
        for tensor in backprop_order.into_iter().rev() {
            tensor.propagate();
        }
        Ok(())
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if !visited.insert(c.borrow().id) {
                continue;
            }
            Tensor(c.clone()).backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }

    /// Pushes the gradient of this node into its children
    fn propagate(&self) {
        let inner = self.0.borrow();
        let (Some(func), Some(grad)) = (&inner.backprop_fn, &inner.grad) else {
            return;
        };
        let contributions = {
            let children: Vec<Ref<InnerTensor>> = inner.children.iter().map(|c| c.borrow()).collect();
            let inputs: Vec<&InnerTensor> = children.iter().map(|c| &**c).collect();
            let needs: Vec<bool> = inputs.iter().map(|c| c.requires_grad).collect();
            input_gradients(func, &inputs, &inner, grad, &needs)
        };
        for (child, contribution) in inner.children.iter().zip(contributions) {
            if let Some(delta) = contribution {
                child.borrow_mut().accumulate(&delta);
            }
        }
    }
}

// Elementwise operations
impl Tensor {
    fn binary_op<F>(&self, other: &Tensor, op: &'static str, func: BackpropFunc, f: F) -> Result<Tensor, TensorError>
    where
        F: Fn(f32, f32) -> f32,
    {
        let (data, shape) = {
            let a = self.0.borrow();
            let b = other.0.borrow();
            let shape = broadcast_shape(&a.shape, &b.shape).ok_or_else(|| TensorError::ShapeMismatch {
                op,
                lhs: a.shape.clone(),
                rhs: b.shape.clone(),
            })?;
            let a_idx = broadcast_offsets(&a.shape, &shape);
            let b_idx = broadcast_offsets(&b.shape, &shape);
            let data = a_idx
                .iter()
                .zip(b_idx.iter())
                .map(|(&i, &j)| f(a.data[i], b.data[j]))
                .collect();
            (data, shape)
        };
        Ok(Self::derived(data, shape, func, &[self, other]))
    }

    fn unary_op<F: Fn(f32) -> f32>(&self, func: BackpropFunc, f: F) -> Tensor {
        let (data, shape) = {
            let a = self.0.borrow();
            (a.data.iter().map(|&x| f(x)).collect(), a.shape.clone())
        };
        Self::derived(data, shape, func, &[self])
    }

    /// Elementwise sum, broadcasting like NumPy
    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.binary_op(other, "add", BackpropFunc::Add, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.binary_op(other, "sub", BackpropFunc::Sub, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.binary_op(other, "mul", BackpropFunc::Mul, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.binary_op(other, "div", BackpropFunc::Div, |a, b| a / b)
    }

    pub fn exp(&self) -> Tensor {
        self.unary_op(BackpropFunc::Exp, f32::exp)
    }

    pub fn log(&self) -> Tensor {
        self.unary_op(BackpropFunc::Log, f32::ln)
    }

    pub fn relu(&self) -> Tensor {
        self.unary_op(BackpropFunc::ReLU, |x| x.max(0.0))
    }

    /// Multiplies every element by a constant
    pub fn scale(&self, c: f32) -> Tensor {
        self.unary_op(BackpropFunc::Scale(c), move |x| x * c)
    }
}

// Reductions
impl Tensor {
    /// Sum of all elements as a scalar
    pub fn sum(&self) -> Tensor {
        let total = self.0.borrow().data.iter().sum();
        Self::derived(vec![total], vec![], BackpropFunc::Sum, &[self])
    }

    /// Mean of all elements as a scalar
    pub fn mean(&self) -> Tensor {
        let mean = {
            let inner = self.0.borrow();
            inner.data.iter().sum::<f32>() / inner.data.len() as f32
        };
        Self::derived(vec![mean], vec![], BackpropFunc::Mean, &[self])
    }

    /// Sums over the last dimension, keeping it with size 1
    pub fn sum_last_dim(&self) -> Result<Tensor, TensorError> {
        let (data, shape) = {
            let inner = self.0.borrow();
            let (n, rows) = last_dim_rows(&inner.shape)?;
            let data = (0..rows)
                .map(|r| inner.data[r * n..(r + 1) * n].iter().sum())
                .collect();
            let mut shape = inner.shape.clone();
            if let Some(last) = shape.last_mut() {
                *last = 1;
            }
            (data, shape)
        };
        Ok(Self::derived(data, shape, BackpropFunc::SumLastDim, &[self]))
    }

    /// Maximum over the last dimension, keeping it with size 1. Not differentiable.
    pub fn max_last_dim(&self) -> Result<Tensor, TensorError> {
        let inner = self.0.borrow();
        let (n, rows) = last_dim_rows(&inner.shape)?;
        if n == 0 {
            return Err(TensorError::EmptyBatch);
        }
        let data = (0..rows)
            .map(|r| {
                inner.data[r * n..(r + 1) * n]
                    .iter()
                    .copied()
                    .fold(f32::NEG_INFINITY, f32::max)
            })
            .collect();
        let mut shape = inner.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = 1;
        }
        Ok(Self::from_parts(data, shape))
    }

    /// Index of the maximum over the last dimension for every row. Not differentiable.
    pub fn argmax_last_dim(&self) -> Result<Vec<usize>, TensorError> {
        let inner = self.0.borrow();
        let (n, rows) = last_dim_rows(&inner.shape)?;
        if n == 0 {
            return Err(TensorError::EmptyBatch);
        }
        let argmax = (0..rows)
            .map(|r| {
                inner.data[r * n..(r + 1) * n]
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(best, best_v), (i, &v)| {
                        if v > best_v { (i, v) } else { (best, best_v) }
                    })
                    .0
            })
            .collect();
        Ok(argmax)
    }
}

// Shape and linear algebra operations
impl Tensor {
    /// Matrix product of `[n, k]` and `[k, m]` tensors
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let (data, shape) = {
            let a = self.0.borrow();
            let b = other.0.borrow();
            if a.shape.len() != 2 || b.shape.len() != 2 || a.shape[1] != b.shape[0] {
                return Err(TensorError::ShapeMismatch {
                    op: "matmul",
                    lhs: a.shape.clone(),
                    rhs: b.shape.clone(),
                });
            }
            let (n, k, m) = (a.shape[0], a.shape[1], b.shape[1]);
            let mut out = vec![0.0; n * m];
            for i in 0..n {
                let out_row = &mut out[i * m..(i + 1) * m];
                for p in 0..k {
                    let a_val = a.data[i * k + p];
                    let b_row = &b.data[p * m..(p + 1) * m];
                    for (o, b_val) in out_row.iter_mut().zip(b_row) {
                        *o += a_val * b_val;
                    }
                }
            }
            (out, vec![n, m])
        };
        Ok(Self::derived(data, shape, BackpropFunc::MatMul, &[self, other]))
    }

    /// Reinterprets the data with a new shape, at most one dimension may be `-1`
    /// and is inferred from the number of elements
    pub fn view(&self, shape: &[isize]) -> Result<Tensor, TensorError> {
        let (data, from) = {
            let inner = self.0.borrow();
            (inner.data.clone(), inner.shape.clone())
        };
        let invalid = || TensorError::InvalidView {
            from: from.clone(),
            to: shape.to_vec(),
        };
        let wildcards = shape.iter().filter(|&&d| d == -1).count();
        if wildcards > 1 || shape.iter().any(|&d| d < -1) {
            return Err(invalid());
        }
        let known: usize = shape.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
        let inferred = if wildcards == 1 {
            if known == 0 || data.len() % known != 0 {
                return Err(invalid());
            }
            data.len() / known
        } else if known != data.len() {
            return Err(invalid());
        } else {
            0
        };
        let new_shape = shape
            .iter()
            .map(|&d| if d == -1 { inferred } else { d as usize })
            .collect();
        Ok(Self::derived(data, new_shape, BackpropFunc::View, &[self]))
    }

    /// Picks `self[r, indices[r]]` for every row of a 2-D tensor
    pub fn gather_last_dim(&self, indices: &[usize]) -> Result<Tensor, TensorError> {
        let data = {
            let inner = self.0.borrow();
            if inner.shape.len() != 2 || inner.shape[0] != indices.len() {
                return Err(TensorError::ShapeMismatch {
                    op: "gather",
                    lhs: inner.shape.clone(),
                    rhs: vec![indices.len()],
                });
            }
            let cols = inner.shape[1];
            indices
                .iter()
                .enumerate()
                .map(|(row, &col)| {
                    if col >= cols {
                        return Err(TensorError::IndexOutOfBounds { index: col, len: cols });
                    }
                    Ok(inner.data[row * cols + col])
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let shape = vec![indices.len()];
        Ok(Self::derived(
            data,
            shape,
            BackpropFunc::GatherLastDim(indices.to_vec()),
            &[self],
        ))
    }

    /// 2-D convolution over a `[batch, in_channels, height, width]` input with a
    /// `[out_channels, in_channels, kh, kw]` weight and `[out_channels]` bias
    pub fn conv2d(&self, weight: &Tensor, bias: &Tensor, stride: usize, padding: usize) -> Result<Tensor, TensorError> {
        if stride == 0 {
            return Err(TensorError::InvalidArgument {
                op: "conv2d",
                reason: "stride must be positive",
            });
        }
        let (data, shape) = {
            let x = self.0.borrow();
            let w = weight.0.borrow();
            let b = bias.0.borrow();
            if x.shape.len() != 4 {
                return Err(TensorError::InvalidShape {
                    expected: "[batch, channels, height, width]".to_string(),
                    got: x.shape.clone(),
                });
            }
            let mismatch = |lhs: &[usize], rhs: &[usize]| TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            };
            if w.shape.len() != 4 || w.shape[1] != x.shape[1] {
                return Err(mismatch(&x.shape, &w.shape));
            }
            if b.shape != [w.shape[0]] {
                return Err(mismatch(&w.shape, &b.shape));
            }
            let [n, cin, h, wd] = dims4(&x.shape);
            let [cout, _, kh, kw] = dims4(&w.shape);
            if h + 2 * padding < kh || wd + 2 * padding < kw {
                return Err(mismatch(&x.shape, &w.shape));
            }
            let oh = conv_out_dim(h, kh, stride, padding);
            let ow = conv_out_dim(wd, kw, stride, padding);

            let mut out = vec![0.0; n * cout * oh * ow];
            for ni in 0..n {
                for co in 0..cout {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let mut acc = b.data[co];
                            for ci in 0..cin {
                                for ky in 0..kh {
                                    let Some(iy) = padded_index(oy * stride + ky, padding, h) else {
                                        continue;
                                    };
                                    for kx in 0..kw {
                                        let Some(ix) = padded_index(ox * stride + kx, padding, wd)
                                        else {
                                            continue;
                                        };
                                        acc += x.data[((ni * cin + ci) * h + iy) * wd + ix]
                                            * w.data[((co * cin + ci) * kh + ky) * kw + kx];
                                    }
                                }
                            }
                            out[((ni * cout + co) * oh + oy) * ow + ox] = acc;
                        }
                    }
                }
            }
            (out, vec![n, cout, oh, ow])
        };
        Ok(Self::derived(
            data,
            shape,
            BackpropFunc::Conv2d { stride, padding },
            &[self, weight, bias],
        ))
    }

    /// Average over non-overlapping `kernel x kernel` windows, trailing rows and columns
    /// which do not fill a window are dropped
    pub fn avg_pool2d(&self, kernel: usize) -> Result<Tensor, TensorError> {
        if kernel == 0 {
            return Err(TensorError::InvalidArgument {
                op: "avg_pool2d",
                reason: "kernel size must be positive",
            });
        }
        let (data, shape) = {
            let inner = self.0.borrow();
            let [n, c, h, w] = image_dims(&inner.shape)?;
            if h < kernel || w < kernel {
                return Err(TensorError::InvalidShape {
                    expected: format!("spatial size of at least {kernel}x{kernel}"),
                    got: inner.shape.clone(),
                });
            }
            let (oh, ow) = (h / kernel, w / kernel);
            let area = (kernel * kernel) as f32;
            let mut out = vec![0.0; n * c * oh * ow];
            for plane in 0..n * c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = 0.0;
                        for iy in oy * kernel..(oy + 1) * kernel {
                            for ix in ox * kernel..(ox + 1) * kernel {
                                acc += inner.data[(plane * h + iy) * w + ix];
                            }
                        }
                        out[(plane * oh + oy) * ow + ox] = acc / area;
                    }
                }
            }
            (out, vec![n, c, oh, ow])
        };
        Ok(Self::derived(data, shape, BackpropFunc::AvgPool2d { kernel }, &[self]))
    }

    /// Averages each plane into an `out_h x out_w` grid of (possibly overlapping) bins
    pub fn adaptive_avg_pool2d(&self, out_h: usize, out_w: usize) -> Result<Tensor, TensorError> {
        if out_h == 0 || out_w == 0 {
            return Err(TensorError::InvalidArgument {
                op: "adaptive_avg_pool2d",
                reason: "output size must be positive",
            });
        }
        let (data, shape) = {
            let inner = self.0.borrow();
            let [n, c, h, w] = image_dims(&inner.shape)?;
            if h == 0 || w == 0 {
                return Err(TensorError::InvalidShape {
                    expected: "non-empty planes".to_string(),
                    got: inner.shape.clone(),
                });
            }
            let mut out = vec![0.0; n * c * out_h * out_w];
            for plane in 0..n * c {
                for oy in 0..out_h {
                    let (y0, y1) = adaptive_bin(oy, h, out_h);
                    for ox in 0..out_w {
                        let (x0, x1) = adaptive_bin(ox, w, out_w);
                        let mut acc = 0.0;
                        for iy in y0..y1 {
                            for ix in x0..x1 {
                                acc += inner.data[(plane * h + iy) * w + ix];
                            }
                        }
                        out[(plane * out_h + oy) * out_w + ox] = acc / ((y1 - y0) * (x1 - x0)) as f32;
                    }
                }
            }
            (out, vec![n, c, out_h, out_w])
        };
        Ok(Self::derived(
            data,
            shape,
            BackpropFunc::AdaptiveAvgPool2d { out_h, out_w },
            &[self],
        ))
    }

    /// Copies the given rows (entries of the leading dimension) into a new leaf tensor
    pub fn select_rows(&self, indices: &[usize]) -> Result<Tensor, TensorError> {
        let inner = self.0.borrow();
        let (rows, row_len) = leading_rows(&inner.shape)?;
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &i in indices {
            if i >= rows {
                return Err(TensorError::IndexOutOfBounds { index: i, len: rows });
            }
            data.extend_from_slice(&inner.data[i * row_len..(i + 1) * row_len]);
        }
        let mut shape = inner.shape.clone();
        shape[0] = indices.len();
        Ok(Self::from_parts(data, shape))
    }

    /// Copies a contiguous range of rows into a new leaf tensor
    pub fn narrow_rows(&self, range: Range<usize>) -> Result<Tensor, TensorError> {
        let inner = self.0.borrow();
        let (rows, row_len) = leading_rows(&inner.shape)?;
        if range.start > range.end || range.end > rows {
            return Err(TensorError::IndexOutOfBounds {
                index: range.end.max(range.start),
                len: rows,
            });
        }
        let data = inner.data[range.start * row_len..range.end * row_len].to_vec();
        let mut shape = inner.shape.clone();
        shape[0] = range.len();
        Ok(Self::from_parts(data, shape))
    }
}

// pretty print the shape and a preview of the data
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        let inner = self.0.borrow();
        write!(f, "Tensor(shape={:?}, data=[", inner.shape)?;
        for (i, v) in inner.data.iter().take(PREVIEW).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.4}", v)?;
        }
        if inner.data.len() > PREVIEW {
            write!(f, ", ...")?;
        }
        write!(f, "]")?;
        if let Some(func) = &inner.backprop_fn {
            write!(f, ", backprop_fn={:?}", func)?;
        } else if inner.requires_grad {
            write!(f, ", requires_grad=true")?;
        }
        write!(f, ")")
    }
}

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.unary_op(BackpropFunc::Neg, |x| -x)
    }
}

impl Neg for Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        -&self
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.0.borrow(), other.0.borrow());
        a.shape == b.shape && a.data == b.data
    }
}

#[derive(Debug)]
pub(crate) struct InnerTensor {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    /// gradient of the output with respect to this tensor, `None` until first accumulated
    pub(crate) grad: Option<Vec<f32>>,
    pub(crate) requires_grad: bool,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedTensor>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerTensor {
    fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self {
            data,
            shape,
            grad: None,
            requires_grad: false,
            children: vec![],
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            backprop_fn: None,
        }
    }

    fn accumulate(&mut self, delta: &[f32]) {
        let n = self.data.len();
        let grad = self.grad.get_or_insert_with(|| vec![0.0; n]);
        for (g, d) in grad.iter_mut().zip(delta) {
            *g += d;
        }
    }
}

/// Result shape of broadcasting two shapes against each other, aligned from the right
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let offset = ndim - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };
    (0..ndim)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// For every element of a tensor of shape `out`, the flat index of the element of a
/// tensor of shape `shape` which is broadcast to it
pub(crate) fn broadcast_offsets(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    // strides aligned to the output, 0 along broadcast dimensions
    let mut strides = vec![0; out.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        if shape[i] != 1 {
            strides[i + offset] = stride;
        }
        stride *= shape[i];
    }

    let numel: usize = out.iter().product();
    let mut offsets = Vec::with_capacity(numel);
    let mut index = vec![0; out.len()];
    for _ in 0..numel {
        offsets.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
        for d in (0..out.len()).rev() {
            index[d] += 1;
            if index[d] < out[d] {
                break;
            }
            index[d] = 0;
        }
    }
    offsets
}

pub(crate) fn dims4(shape: &[usize]) -> [usize; 4] {
    [shape[0], shape[1], shape[2], shape[3]]
}

fn image_dims(shape: &[usize]) -> Result<[usize; 4], TensorError> {
    if shape.len() != 4 {
        return Err(TensorError::InvalidShape {
            expected: "[batch, channels, height, width]".to_string(),
            got: shape.to_vec(),
        });
    }
    Ok(dims4(shape))
}

pub(crate) fn conv_out_dim(size: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (size + 2 * padding - kernel) / stride + 1
}

/// Maps a position in the zero padded input back to the unpadded input, `None` in the padding
pub(crate) fn padded_index(pos: usize, padding: usize, size: usize) -> Option<usize> {
    pos.checked_sub(padding).filter(|&i| i < size)
}

/// Half open input range averaged into output cell `i` of an adaptive pool
pub(crate) fn adaptive_bin(i: usize, size: usize, out: usize) -> (usize, usize) {
    let start = i * size / out;
    let end = ((i + 1) * size).div_ceil(out);
    (start, end)
}

/// Size of the last dimension and the number of rows over it
fn last_dim_rows(shape: &[usize]) -> Result<(usize, usize), TensorError> {
    match shape.split_last() {
        Some((&n, rest)) => Ok((n, rest.iter().product())),
        None => Err(TensorError::InvalidShape {
            expected: "at least one dimension".to_string(),
            got: shape.to_vec(),
        }),
    }
}

/// Size of the leading dimension and the number of elements per entry of it
fn leading_rows(shape: &[usize]) -> Result<(usize, usize), TensorError> {
    match shape.split_first() {
        Some((&rows, rest)) => Ok((rows, rest.iter().product())),
        None => Err(TensorError::InvalidShape {
            expected: "at least one dimension".to_string(),
            got: shape.to_vec(),
        }),
    }
}
