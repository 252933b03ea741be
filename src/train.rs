//! Training loops: the hand-written one, and `fit` over modules, optimizers and loaders

use rand::Rng;
use thiserror::Error;

use crate::{
    dataloader::Loader,
    loss::{LossFn, accuracy, log_softmax, nll},
    models::{MnistLinear, N_CLASSES, N_PIXELS},
    nn::{Module, NNError},
    optim::{Optim, SGD, manual_sgd_step},
    tensor::{Tensor, TensorError, no_grad},
};

/// Errors while training or evaluating
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("Validation loader yielded no samples")]
    EmptyValidation,
}

/// Per-epoch results of [`fit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitReport {
    /// Size weighted mean validation loss after every epoch
    pub val_losses: Vec<f32>,
}

impl FitReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.val_losses.last().copied()
    }
}

/// Weights and bias as bare tensors with a hand-written forward pass
pub struct ManualLinear {
    pub weights: Tensor,
    pub bias: Tensor,
}

impl ManualLinear {
    /// Standard normal weights scaled by `1 / sqrt(784)`, standard normal bias
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let weights = Tensor::randn(&[N_PIXELS, N_CLASSES], rng).scale(1.0 / (N_PIXELS as f32).sqrt());
        Self::from_parameters(weights, Tensor::randn(&[N_CLASSES], rng))
    }

    pub fn from_parameters(weights: Tensor, bias: Tensor) -> Self {
        Self {
            weights: weights.requires_grad_(),
            bias: bias.requires_grad_(),
        }
    }

    /// Log probabilities `log_softmax(x @ weights + bias)`
    pub fn forward(&self, xb: &Tensor) -> Result<Tensor, TensorError> {
        log_softmax(&xb.matmul(&self.weights)?.add(&self.bias)?)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }

    /// Size weighted mean `nll` over every batch of `loader`
    pub fn validation_loss(&self, loader: &dyn Loader) -> Result<f32, TrainError> {
        let _guard = no_grad();
        let (mut total, mut count) = (0.0f64, 0usize);
        for batch in loader.batches() {
            let (xb, yb) = batch?;
            let n = xb.len();
            total += nll(&self.forward(&xb)?, &yb)?.item()? as f64 * n as f64;
            count += n;
        }
        if count == 0 {
            return Err(TrainError::EmptyValidation);
        }
        Ok((total / count as f64) as f32)
    }
}

/// Gradient descent without any abstraction: slices contiguous batches out of the raw
/// tensors and updates the parameters by hand. Returns the loss of the last batch.
pub fn train_manual(
    model: &ManualLinear,
    x_train: &Tensor,
    y_train: &Tensor,
    epochs: usize,
    batch_size: usize,
    lr: f32,
) -> Result<f32, TrainError> {
    if batch_size == 0 {
        return Err(TensorError::InvalidArgument {
            op: "train_manual",
            reason: "batch size must be positive",
        }
        .into());
    }
    let n = x_train.len();
    let mut params = model.parameters();
    let mut last_loss = f32::NAN;
    for epoch in 0..epochs {
        for i in 0..n.div_ceil(batch_size) {
            let start_i = i * batch_size;
            let end_i = (start_i + batch_size).min(n);
            let xb = x_train.narrow_rows(start_i..end_i)?;
            let yb = y_train.narrow_rows(start_i..end_i)?;
            let pred = model.forward(&xb)?;
            let loss = nll(&pred, &yb)?;

            loss.backward()?;
            manual_sgd_step(&mut params, lr);
            last_loss = loss.item()?;
        }
        log::debug!("manual epoch {}: last batch loss {}", epoch, last_loss);
    }
    Ok(last_loss)
}

/// Computes the loss of one batch, and if an optimizer is given also takes a step with it.
/// Returns the loss and the number of samples in the batch.
pub fn loss_batch(
    model: &dyn Module,
    loss_fn: LossFn,
    xb: &Tensor,
    yb: &Tensor,
    opt: Option<&mut dyn Optim>,
) -> Result<(f32, usize), TrainError> {
    let loss = loss_fn(&model.forward(xb)?, yb)?;

    if let Some(opt) = opt {
        loss.backward()?;
        opt.step();
        opt.zero_grad();
    }

    Ok((loss.item()?, xb.len()))
}

/// Trains for `epochs` passes over `train_dl`, evaluating on `valid_dl` after each one
pub fn fit(
    epochs: usize,
    model: &mut dyn Module,
    loss_fn: LossFn,
    opt: &mut dyn Optim,
    train_dl: &dyn Loader,
    valid_dl: &dyn Loader,
) -> Result<FitReport, TrainError> {
    let mut report = FitReport::default();
    for epoch in 0..epochs {
        model.train();
        for batch in train_dl.batches() {
            let (xb, yb) = batch?;
            loss_batch(&*model, loss_fn, &xb, &yb, Some(&mut *opt))?;
        }

        model.eval();
        let val_loss = {
            let _guard = no_grad();
            let mut total = 0.0f64;
            let mut count = 0usize;
            for batch in valid_dl.batches() {
                let (xb, yb) = batch?;
                let (loss, n) = loss_batch(&*model, loss_fn, &xb, &yb, None)?;
                total += loss as f64 * n as f64;
                count += n;
            }
            if count == 0 {
                return Err(TrainError::EmptyValidation);
            }
            (total / count as f64) as f32
        };

        log::info!("epoch: {}, val_loss: {}", epoch, val_loss);
        println!("{} {}", epoch, val_loss);
        report.val_losses.push(val_loss);
    }
    Ok(report)
}

/// Size weighted mean loss and accuracy of `model` over every batch of `loader`
pub fn evaluate(model: &dyn Module, loss_fn: LossFn, loader: &dyn Loader) -> Result<(f32, f32), TrainError> {
    let _guard = no_grad();
    let (mut total_loss, mut total_correct, mut count) = (0.0f64, 0.0f64, 0usize);
    for batch in loader.batches() {
        let (xb, yb) = batch?;
        let out = model.forward(&xb)?;
        let n = xb.len();
        total_loss += loss_fn(&out, &yb)?.item()? as f64 * n as f64;
        total_correct += accuracy(&out, &yb)? as f64 * n as f64;
        count += n;
    }
    if count == 0 {
        return Err(TrainError::EmptyValidation);
    }
    Ok(((total_loss / count as f64) as f32, (total_correct / count as f64) as f32))
}

/// A fresh linear model and a plain SGD optimizer over its parameters
pub fn get_model<R: Rng>(lr: f32, rng: &mut R) -> (MnistLinear, SGD) {
    let model = MnistLinear::new(rng);
    let opt = SGD::new(model.parameters(), lr, 0.0);
    (model, opt)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        assert_eq_float,
        dataloader::{DataLoader, TensorDataset, WrappedDataLoader, get_data},
        loss::cross_entropy,
        models::{MnistLogistic, preprocess, sequential_cnn_adaptive},
    };

    /// Separable data: sample `i` has class `i % 10` and lights up pixels in its class's band
    fn synthetic(n: usize) -> (Tensor, Tensor) {
        let band = N_PIXELS / N_CLASSES;
        let mut x = vec![0.0; n * N_PIXELS];
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % N_CLASSES;
            for j in 0..4 {
                x[i * N_PIXELS + class * band + (i + j) % band] = 1.0;
            }
            y.push(class as f32);
        }
        (
            Tensor::new(x, &[n, N_PIXELS]).unwrap(),
            Tensor::new(y, &[n]).unwrap(),
        )
    }

    fn initial_parameters(seed: u64) -> (Vec<f32>, Vec<f32>) {
        let model = ManualLinear::new(&mut Pcg64Mcg::seed_from_u64(seed));
        (model.weights.data(), model.bias.data())
    }

    #[test]
    fn test_manual_and_module_training_agree() {
        let (x, y) = synthetic(150);
        let (w0, b0) = initial_parameters(0);
        let (epochs, bs, lr) = (2, 64, 0.5);

        let manual = ManualLinear::from_parameters(
            Tensor::new(w0.clone(), &[N_PIXELS, N_CLASSES]).unwrap(),
            Tensor::new(b0.clone(), &[N_CLASSES]).unwrap(),
        );
        let manual_last = train_manual(&manual, &x, &y, epochs, bs, lr).unwrap();

        let mut model = MnistLogistic::from_parameters(
            Tensor::new(w0, &[N_PIXELS, N_CLASSES]).unwrap(),
            Tensor::new(b0, &[N_CLASSES]).unwrap(),
        );
        let mut opt = SGD::new(model.parameters(), lr, 0.0);
        let train_dl = DataLoader::new(TensorDataset::new(x.clone(), y.clone()).unwrap(), bs, false).unwrap();
        let mut module_last = f32::NAN;
        model.train();
        for _ in 0..epochs {
            for batch in train_dl.iter() {
                let (xb, yb) = batch.unwrap();
                module_last = loss_batch(&model, cross_entropy, &xb, &yb, Some(&mut opt)).unwrap().0;
            }
        }

        assert_eq_float!(manual_last, module_last, 1e-5);
        let manual_full = nll(&manual.forward(&x).unwrap(), &y).unwrap().item().unwrap();
        let module_full = cross_entropy(&model.forward(&x).unwrap(), &y).unwrap().item().unwrap();
        assert_eq_float!(manual_full, module_full, 1e-5);
        for (p, q) in manual.weights.data().iter().zip(model.weights.data()) {
            assert_eq_float!(*p, q, 1e-5);
        }
    }

    #[test]
    fn test_manual_validation_loss() {
        let (x, y) = synthetic(30);
        let model = ManualLinear::new(&mut Pcg64Mcg::seed_from_u64(2));
        let valid_dl = DataLoader::new(TensorDataset::new(x.clone(), y.clone()).unwrap(), 8, false).unwrap();
        let expected = nll(&model.forward(&x).unwrap(), &y).unwrap().item().unwrap();
        assert_eq_float!(model.validation_loss(&valid_dl).unwrap(), expected, 1e-4);

        let empty = TensorDataset::new(Tensor::zeros(&[0, N_PIXELS]), Tensor::zeros(&[0])).unwrap();
        let empty_dl = DataLoader::new(empty, 8, false).unwrap();
        assert!(matches!(
            model.validation_loss(&empty_dl),
            Err(TrainError::EmptyValidation)
        ));
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let run = || {
            let mut rng = Pcg64Mcg::seed_from_u64(9);
            let (x, y) = synthetic(60);
            let ds = TensorDataset::new(x, y).unwrap();
            let train_dl = DataLoader::new(ds.clone(), 16, true).unwrap().with_seed(1);
            let valid_dl = DataLoader::new(ds, 32, false).unwrap();
            let (mut model, mut opt) = get_model(0.5, &mut rng);
            let report = fit(2, &mut model, cross_entropy, &mut opt, &train_dl, &valid_dl).unwrap();
            (report, model.parameters().iter().map(Tensor::data).collect::<Vec<_>>())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fit_reduces_validation_loss() {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let (x, y) = synthetic(200);
        let ds = TensorDataset::new(x, y).unwrap();
        let (train_dl, valid_dl) = get_data(ds.clone(), ds, 64).unwrap();
        let train_dl = train_dl.with_seed(3);
        let (mut model, mut opt) = get_model(0.5, &mut rng);
        let (initial_loss, _) = evaluate(&model, cross_entropy, &valid_dl).unwrap();

        let report = fit(30, &mut model, cross_entropy, &mut opt, &train_dl, &valid_dl).unwrap();
        assert_eq!(report.val_losses.len(), 30);
        assert!(report.val_losses[0] < initial_loss);
        assert!(report.final_loss().unwrap() < report.val_losses[0]);

        let (loss, acc) = evaluate(&model, cross_entropy, &valid_dl).unwrap();
        assert_eq_float!(loss, report.final_loss().unwrap(), 1e-4);
        assert!(acc > 0.5);
    }

    #[test]
    fn test_loss_batch_without_optimizer_leaves_parameters() {
        let mut rng = Pcg64Mcg::seed_from_u64(4);
        let (x, y) = synthetic(20);
        let (model, _) = get_model(0.5, &mut rng);
        let before = model.parameters().iter().map(Tensor::data).collect::<Vec<_>>();
        let (loss, n) = loss_batch(&model, cross_entropy, &x, &y, None).unwrap();
        assert!(loss.is_finite());
        assert_eq!(n, 20);
        let after = model.parameters().iter().map(Tensor::data).collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn test_empty_validation_is_an_error() {
        let mut rng = Pcg64Mcg::seed_from_u64(5);
        let (x, y) = synthetic(10);
        let train_dl = DataLoader::new(TensorDataset::new(x, y).unwrap(), 4, false).unwrap();
        let empty = TensorDataset::new(Tensor::zeros(&[0, N_PIXELS]), Tensor::zeros(&[0])).unwrap();
        let valid_dl = DataLoader::new(empty, 8, false).unwrap();
        let (mut model, mut opt) = get_model(0.5, &mut rng);
        assert!(matches!(
            fit(1, &mut model, cross_entropy, &mut opt, &train_dl, &valid_dl),
            Err(TrainError::EmptyValidation)
        ));
    }

    #[test]
    fn test_fit_wrapped_cnn() {
        let mut rng = Pcg64Mcg::seed_from_u64(6);
        let (x, y) = synthetic(20);
        let ds = TensorDataset::new(x, y).unwrap();
        let (train_dl, valid_dl) = get_data(ds.clone(), ds, 10).unwrap();
        let train_dl = WrappedDataLoader::new(train_dl, preprocess);
        let valid_dl = WrappedDataLoader::new(valid_dl, preprocess);
        let mut model = sequential_cnn_adaptive(&mut rng);
        let mut opt = SGD::new(model.parameters(), 0.1, 0.9);
        let report = fit(1, &mut model, cross_entropy, &mut opt, &train_dl, &valid_dl).unwrap();
        assert!(report.final_loss().unwrap().is_finite());
        assert!(!model.is_training());
    }
}
