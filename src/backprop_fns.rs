//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use crate::tensor::{InnerTensor, adaptive_bin, broadcast_offsets, dims4, padded_index};

/// Represents the function in the computation graph, along with any static arguments
/// needed to replay it backwards
#[derive(Debug, Clone, PartialEq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    ReLU,
    Scale(f32),
    Sum,
    Mean,
    SumLastDim,
    MatMul,
    View,
    /// Row-wise pick of one element per row, the chosen column per row
    GatherLastDim(Vec<usize>),
    Conv2d {
        stride: usize,
        padding: usize,
    },
    AvgPool2d {
        kernel: usize,
    },
    AdaptiveAvgPool2d {
        out_h: usize,
        out_w: usize,
    },
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::MatMul => 2,
            BackpropFunc::Conv2d { .. } => 3,
            _ => 1,
        }
    }
}

type Gradients = Vec<Option<Vec<f32>>>;

/// Computes the gradient contribution of `out` to each of its inputs.
///
/// `grad` is the gradient accumulated on `out`. Entries of the result are `None` for
/// inputs which do not require a gradient (as flagged in `needs`).
pub(crate) fn input_gradients(
    func: &BackpropFunc,
    inputs: &[&InnerTensor],
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
) -> Gradients {
    debug_assert_eq!(inputs.len(), func.n_operands());
    match func {
        BackpropFunc::Add => binary(inputs, out, grad, needs, |g, _, _| (g, g)),
        BackpropFunc::Sub => binary(inputs, out, grad, needs, |g, _, _| (g, -g)),
        BackpropFunc::Mul => binary(inputs, out, grad, needs, |g, a, b| (g * b, g * a)),
        BackpropFunc::Div => binary(inputs, out, grad, needs, |g, a, b| {
            (g / b, -g * a / (b * b))
        }),
        BackpropFunc::Neg => unary(inputs, out, grad, needs, |g, _, _| -g),
        // d exp(x) / dx = exp(x), which is the output
        BackpropFunc::Exp => unary(inputs, out, grad, needs, |g, _, y| g * y),
        BackpropFunc::Log => unary(inputs, out, grad, needs, |g, x, _| g / x),
        BackpropFunc::ReLU => unary(inputs, out, grad, needs, |g, x, _| {
            if x > 0.0 { g } else { 0.0 }
        }),
        BackpropFunc::Scale(c) => unary(inputs, out, grad, needs, |g, _, _| g * c),
        BackpropFunc::Sum => {
            vec![needs[0].then(|| vec![grad[0]; inputs[0].data.len()])]
        }
        BackpropFunc::Mean => {
            let n = inputs[0].data.len();
            vec![needs[0].then(|| vec![grad[0] / n as f32; n])]
        }
        BackpropFunc::SumLastDim => vec![needs[0].then(|| sum_last_dim(inputs[0], grad))],
        BackpropFunc::MatMul => matmul(inputs, grad, needs),
        BackpropFunc::View => vec![needs[0].then(|| grad.to_vec())],
        BackpropFunc::GatherLastDim(indices) => {
            vec![needs[0].then(|| gather_last_dim(inputs[0], indices, grad))]
        }
        BackpropFunc::Conv2d { stride, padding } => {
            conv2d(inputs, out, grad, needs, *stride, *padding)
        }
        BackpropFunc::AvgPool2d { kernel } => {
            vec![needs[0].then(|| avg_pool2d(inputs[0], out, grad, *kernel))]
        }
        BackpropFunc::AdaptiveAvgPool2d { out_h, out_w } => {
            vec![needs[0].then(|| adaptive_avg_pool2d(inputs[0], grad, *out_h, *out_w))]
        }
    }
}

/// Backprop for broadcasting elementwise `in1 (op) in2 = out`.
/// `f(grad, a, b)` returns the local gradients for both operands, which are summed
/// over every broadcast position.
fn binary<F>(
    inputs: &[&InnerTensor],
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    f: F,
) -> Gradients
where
    F: Fn(f32, f32, f32) -> (f32, f32),
{
    let (a, b) = (inputs[0], inputs[1]);
    let a_idx = broadcast_offsets(&a.shape, &out.shape);
    let b_idx = broadcast_offsets(&b.shape, &out.shape);
    let mut a_grad = vec![0.0; a.data.len()];
    let mut b_grad = vec![0.0; b.data.len()];
    for (i, &g) in grad.iter().enumerate() {
        let (da, db) = f(g, a.data[a_idx[i]], b.data[b_idx[i]]);
        a_grad[a_idx[i]] += da;
        b_grad[b_idx[i]] += db;
    }
    vec![needs[0].then_some(a_grad), needs[1].then_some(b_grad)]
}

/// Backprop for elementwise `op(in) = out`, `f(grad, x, y)` is the local gradient
fn unary<F>(inputs: &[&InnerTensor], out: &InnerTensor, grad: &[f32], needs: &[bool], f: F) -> Gradients
where
    F: Fn(f32, f32, f32) -> f32,
{
    if !needs[0] {
        return vec![None];
    }
    let x = inputs[0];
    let in_grad = grad
        .iter()
        .zip(x.data.iter().zip(out.data.iter()))
        .map(|(&g, (&x, &y))| f(g, x, y))
        .collect();
    vec![Some(in_grad)]
}

fn sum_last_dim(x: &InnerTensor, grad: &[f32]) -> Vec<f32> {
    let n = x.shape.last().copied().unwrap_or(1);
    if n == 0 {
        return vec![];
    }
    (0..x.data.len()).map(|i| grad[i / n]).collect()
}

/// Represents backprop for `a @ b = out` with `a: [n, k]`, `b: [k, m]`
/// grad_a = grad @ b^T, grad_b = a^T @ grad
fn matmul(inputs: &[&InnerTensor], grad: &[f32], needs: &[bool]) -> Gradients {
    let (a, b) = (inputs[0], inputs[1]);
    let (n, k, m) = (a.shape[0], a.shape[1], b.shape[1]);

    let a_grad = needs[0].then(|| {
        let mut a_grad = vec![0.0; n * k];
        for i in 0..n {
            let g_row = &grad[i * m..(i + 1) * m];
            for p in 0..k {
                let b_row = &b.data[p * m..(p + 1) * m];
                a_grad[i * k + p] = g_row.iter().zip(b_row).map(|(g, b)| g * b).sum();
            }
        }
        a_grad
    });
    let b_grad = needs[1].then(|| {
        let mut b_grad = vec![0.0; k * m];
        for i in 0..n {
            let g_row = &grad[i * m..(i + 1) * m];
            for p in 0..k {
                let a_val = a.data[i * k + p];
                for (bg, g) in b_grad[p * m..(p + 1) * m].iter_mut().zip(g_row) {
                    *bg += a_val * g;
                }
            }
        }
        b_grad
    });
    vec![a_grad, b_grad]
}

fn gather_last_dim(x: &InnerTensor, indices: &[usize], grad: &[f32]) -> Vec<f32> {
    let cols = x.shape[1];
    let mut in_grad = vec![0.0; x.data.len()];
    for (row, (&col, &g)) in indices.iter().zip(grad).enumerate() {
        in_grad[row * cols + col] += g;
    }
    in_grad
}

/// Represents backprop for `conv2d(x, w, b) = out` on NCHW tensors
fn conv2d(
    inputs: &[&InnerTensor],
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    stride: usize,
    padding: usize,
) -> Gradients {
    let (x, w) = (inputs[0], inputs[1]);
    let [n, cin, h, wd] = dims4(&x.shape);
    let [cout, _, kh, kw] = dims4(&w.shape);
    let (oh, ow) = (out.shape[2], out.shape[3]);

    let mut x_grad = vec![0.0; x.data.len()];
    let mut w_grad = vec![0.0; w.data.len()];
    let mut b_grad = vec![0.0; cout];
    for ni in 0..n {
        for co in 0..cout {
            for oy in 0..oh {
                for ox in 0..ow {
                    let g = grad[((ni * cout + co) * oh + oy) * ow + ox];
                    if g == 0.0 {
                        continue;
                    }
                    b_grad[co] += g;
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
                                let xi = ((ni * cin + ci) * h + iy) * wd + ix;
                                let wi = ((co * cin + ci) * kh + ky) * kw + kx;
                                x_grad[xi] += g * w.data[wi];
                                w_grad[wi] += g * x.data[xi];
                            }
                        }
                    }
                }
            }
        }
    }
    vec![
        needs[0].then_some(x_grad),
        needs[1].then_some(w_grad),
        needs[2].then_some(b_grad),
    ]
}

fn avg_pool2d(x: &InnerTensor, out: &InnerTensor, grad: &[f32], kernel: usize) -> Vec<f32> {
    let [n, c, h, w] = dims4(&x.shape);
    let (oh, ow) = (out.shape[2], out.shape[3]);
    let area = (kernel * kernel) as f32;
    let mut in_grad = vec![0.0; x.data.len()];
    for plane in 0..n * c {
        for oy in 0..oh {
            for ox in 0..ow {
                let g = grad[(plane * oh + oy) * ow + ox] / area;
                for iy in oy * kernel..(oy + 1) * kernel {
                    for ix in ox * kernel..(ox + 1) * kernel {
                        in_grad[(plane * h + iy) * w + ix] += g;
                    }
                }
            }
        }
    }
    in_grad
}

fn adaptive_avg_pool2d(x: &InnerTensor, grad: &[f32], out_h: usize, out_w: usize) -> Vec<f32> {
    let [n, c, h, w] = dims4(&x.shape);
    let mut in_grad = vec![0.0; x.data.len()];
    for plane in 0..n * c {
        for oy in 0..out_h {
            let (y0, y1) = adaptive_bin(oy, h, out_h);
            for ox in 0..out_w {
                let (x0, x1) = adaptive_bin(ox, w, out_w);
                let g = grad[(plane * out_h + oy) * out_w + ox] / ((y1 - y0) * (x1 - x0)) as f32;
                for iy in y0..y1 {
                    for ix in x0..x1 {
                        in_grad[(plane * h + iy) * w + ix] += g;
                    }
                }
            }
        }
    }
    in_grad
}
