//! Loss function(s) and metrics for classification

use crate::tensor::{Tensor, TensorError};

/// Signature shared by the loss functions, `(scores, targets) -> scalar loss`
pub type LossFn = fn(&Tensor, &Tensor) -> Result<Tensor, TensorError>;

/// Row-wise log-softmax over the last dimension.
///
/// The row maximum is subtracted before exponentiating so large scores cannot overflow.
/// The shift is a constant of the graph, so values and gradients are those of
/// `x - log(sum(exp(x)))`.
pub fn log_softmax(x: &Tensor) -> Result<Tensor, TensorError> {
    let shift = x.max_last_dim()?;
    let shifted = x.sub(&shift)?;
    let log_sum_exp = shifted.exp().sum_last_dim()?.log();
    shifted.sub(&log_sum_exp)
}

/// Negative log-likelihood of integer class targets given `[batch, classes]` log probabilities
pub fn nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor, TensorError> {
    let shape = log_probs.shape();
    let [batch, classes] = shape[..] else {
        return Err(TensorError::InvalidShape {
            expected: "[batch, classes]".to_string(),
            got: shape,
        });
    };
    if targets.shape() != [batch] {
        return Err(TensorError::ShapeMismatch {
            op: "nll",
            lhs: shape,
            rhs: targets.shape(),
        });
    }
    if batch == 0 {
        return Err(TensorError::EmptyBatch);
    }
    let indices = class_indices(targets, classes)?;
    Ok(-log_probs.gather_last_dim(&indices)?.mean())
}

/// Cross entropy between raw scores and integer class targets, i.e. `nll(log_softmax(x))`
pub fn cross_entropy(scores: &Tensor, targets: &Tensor) -> Result<Tensor, TensorError> {
    nll(&log_softmax(scores)?, targets)
}

/// Fraction of rows whose highest score is the target class
pub fn accuracy(scores: &Tensor, targets: &Tensor) -> Result<f32, TensorError> {
    let preds = scores.argmax_last_dim()?;
    let targets = targets.data();
    if preds.len() != targets.len() {
        return Err(TensorError::ShapeMismatch {
            op: "accuracy",
            lhs: scores.shape(),
            rhs: vec![targets.len()],
        });
    }
    if preds.is_empty() {
        return Err(TensorError::EmptyBatch);
    }
    let correct = preds
        .iter()
        .zip(targets.iter())
        .filter(|&(&p, &t)| p as f32 == t)
        .count();
    Ok(correct as f32 / preds.len() as f32)
}

/// Converts a tensor of integer valued labels into class indices
fn class_indices(targets: &Tensor, classes: usize) -> Result<Vec<usize>, TensorError> {
    targets
        .data()
        .into_iter()
        .map(|t| {
            if t >= 0.0 && t.fract() == 0.0 && (t as usize) < classes {
                Ok(t as usize)
            } else {
                Err(TensorError::InvalidTarget { target: t, classes })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn scores() -> Tensor {
        Tensor::new(vec![1.0, 2.0, 3.0, 1.0, -1.0, 0.0], &[2, 3])
            .unwrap()
            .requires_grad_()
    }

    #[test]
    fn test_log_softmax() {
        let out = log_softmax(&scores()).unwrap();
        assert_eq!(out.shape(), vec![2, 3]);
        for row in out.data().chunks(3) {
            let total: f32 = row.iter().map(|v| v.exp()).sum();
            assert_eq_float!(total, 1.0);
        }
        assert_eq_float!(out.data()[2], -0.407_606);
    }

    #[test]
    fn test_log_softmax_large_scores() {
        // exp(1000) overflows without the shift
        let x = Tensor::new(vec![1000.0, 1000.0], &[1, 2]).unwrap();
        let out = log_softmax(&x).unwrap();
        assert_eq_float!(out.data()[0], -std::f32::consts::LN_2);
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_nll() {
        let log_probs = Tensor::new(vec![-0.5, -1.0, -2.0, -3.0], &[2, 2]).unwrap();
        let targets = Tensor::new(vec![0.0, 1.0], &[2]).unwrap();
        assert_eq_float!(nll(&log_probs, &targets).unwrap().item().unwrap(), 1.75);
    }

    #[test]
    fn test_cross_entropy_grad() {
        // d loss / d x = (softmax(x) - one_hot(target)) / batch
        let x = scores();
        let targets = Tensor::new(vec![2.0, 0.0], &[2]).unwrap();
        let loss = cross_entropy(&x, &targets).unwrap();
        loss.backward().unwrap();

        let probs: Vec<f32> = log_softmax(&x).unwrap().data().iter().map(|v| v.exp()).collect();
        let mut expected = probs.clone();
        expected[2] -= 1.0;
        expected[3] -= 1.0;
        for (g, e) in x.grad().iter().zip(expected) {
            assert_eq_float!(*g, e / 2.0);
        }
    }

    #[test]
    fn test_invalid_targets() {
        let x = scores();
        let out_of_range = Tensor::new(vec![3.0, 0.0], &[2]).unwrap();
        assert_eq!(
            cross_entropy(&x, &out_of_range).unwrap_err(),
            TensorError::InvalidTarget {
                target: 3.0,
                classes: 3
            }
        );
        let fractional = Tensor::new(vec![0.5, 0.0], &[2]).unwrap();
        assert!(cross_entropy(&x, &fractional).is_err());
        let wrong_len = Tensor::new(vec![0.0], &[1]).unwrap();
        assert!(matches!(
            cross_entropy(&x, &wrong_len),
            Err(TensorError::ShapeMismatch { op: "nll", .. })
        ));
    }

    #[test]
    fn test_accuracy() {
        let x = scores();
        let all_right = Tensor::new(vec![2.0, 0.0], &[2]).unwrap();
        assert_eq!(accuracy(&x, &all_right).unwrap(), 1.0);
        let all_wrong = Tensor::new(vec![0.0, 1.0], &[2]).unwrap();
        assert_eq!(accuracy(&x, &all_wrong).unwrap(), 0.0);
        let half = Tensor::new(vec![2.0, 1.0], &[2]).unwrap();
        assert_eq!(accuracy(&x, &half).unwrap(), 0.5);

        let empty = Tensor::zeros(&[0, 3]);
        assert_eq!(
            accuracy(&empty, &Tensor::zeros(&[0])).unwrap_err(),
            TensorError::EmptyBatch
        );
    }
}
