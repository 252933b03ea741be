//! Trains MNIST digit classifiers with the library provided by `mnist_grad`,
//! stage by stage from a hand-written training loop to a convolutional network fed by
//! a wrapped data loader.
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run --release -- -h
//! cargo run --release -- --stage all --plot output/losses.png
//! ```
//!
//! The archive is downloaded once into `<data-dir>/mnist/`.

use std::{
    error::Error,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use mnist_grad::{
    dataloader::{DataLoader, Dataset, TensorDataset, WrappedDataLoader, get_data},
    loss::{LossFn, accuracy, cross_entropy, nll},
    mnist::{self, MnistSplits},
    models::{MnistCnn, MnistLogistic, preprocess, sequential_cnn, sequential_cnn_adaptive},
    nn::Module,
    optim::SGD,
    plot::{plot_image, plot_losses},
    train::{ManualLinear, evaluate, fit, get_model, train_manual},
};

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// Which model and training setup to run
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq)]
enum Stage {
    /// Raw tensors, hand-written forward pass and parameter updates
    Manual,
    /// Parameters held by a module, updated by an optimizer
    Logistic,
    /// A `Linear` layer
    Linear,
    /// Three convolutions with momentum SGD
    Cnn,
    /// The convolutional network as a `Sequential` with reshaping lambdas
    Sequential,
    /// Reshaping moved into a wrapped loader, adaptive pooling
    Wrapped,
    /// Every stage in order
    All,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Manual => write!(f, "manual"),
            Stage::Logistic => write!(f, "logistic"),
            Stage::Linear => write!(f, "linear"),
            Stage::Cnn => write!(f, "cnn"),
            Stage::Sequential => write!(f, "sequential"),
            Stage::Wrapped => write!(f, "wrapped"),
            Stage::All => write!(f, "all"),
        }
    }
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Stage::All)]
    stage: Stage,
    #[clap(short, long, default_value_t = 2)]
    epochs: usize,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    /// Learning rate of the linear stages
    #[clap(short, long, default_value_t = 0.5)]
    lr: f32,
    /// Learning rate of the convolutional stages
    #[clap(long, default_value_t = 0.1)]
    cnn_lr: f32,
    /// Momentum of the convolutional stages
    #[clap(short, long, default_value_t = 0.9)]
    momentum: f32,
    /// Seed for initialisation and shuffling, random when not given
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long, default_value = "data")]
    data_dir: PathBuf,
    /// Only use the first N training and validation samples
    #[clap(long)]
    limit: Option<usize>,
    /// Save a chart of the validation losses to this file
    #[clap(short, long)]
    plot: Option<PathBuf>,
    /// Save the first training image to this file
    #[clap(long)]
    image: Option<PathBuf>,
}

const STAGES: [Stage; 6] = [
    Stage::Manual,
    Stage::Logistic,
    Stage::Linear,
    Stage::Cnn,
    Stage::Sequential,
    Stage::Wrapped,
];

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    log::info!("seed: {}", seed);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);

    let path = mnist::ensure_dataset(&args.data_dir)?;
    let MnistSplits { train, valid, .. } = mnist::load(&path)?;
    let (train, valid) = match args.limit {
        Some(n) => (train.head(n)?, valid.head(n)?),
        None => (train, valid),
    };

    if let Some(image) = &args.image {
        create_parent(image)?;
        let (x, y) = train.get(0)?;
        plot_image(&x.data(), path_str(image)?, &format!("label {}", y.item()?))?;
    }

    let stages = match args.stage {
        Stage::All => STAGES.to_vec(),
        stage => vec![stage],
    };
    let mut runs = Vec::new();
    for stage in stages {
        log::info!("stage: {}", stage);
        let losses = run_stage(stage, &args, &train, &valid, &mut rng, seed)?;
        runs.push((stage.to_string(), losses));
    }

    if let Some(plot) = &args.plot {
        create_parent(plot)?;
        let runs = runs
            .iter()
            .map(|(name, losses)| (name.as_str(), losses.as_slice()))
            .collect::<Vec<_>>();
        plot_losses(&runs, path_str(plot)?, "MNIST validation loss")?;
    }
    Ok(())
}

/// Trains one stage and returns its validation loss after every epoch
fn run_stage(
    stage: Stage,
    args: &Args,
    train: &TensorDataset,
    valid: &TensorDataset,
    rng: &mut Pcg64Mcg,
    seed: u64,
) -> Result<Vec<f32>, Box<dyn Error>> {
    let (epochs, bs) = (args.epochs, args.batch_size);
    let loss_fn: LossFn = cross_entropy;
    let (train_dl, valid_dl) = get_data(train.clone(), valid.clone(), bs)?;
    let train_dl = train_dl.with_seed(seed);

    let report = match stage {
        Stage::Manual => return manual(args, train, valid, rng),
        Stage::Logistic => {
            let mut model = MnistLogistic::new(rng);
            let mut opt = SGD::new(model.parameters(), args.lr, 0.0);
            fit(epochs, &mut model, loss_fn, &mut opt, &train_dl, &valid_dl)?
        }
        Stage::Linear => {
            let (mut model, mut opt) = get_model(args.lr, rng);
            fit(epochs, &mut model, loss_fn, &mut opt, &train_dl, &valid_dl)?
        }
        Stage::Cnn => {
            let mut model = MnistCnn::new(rng);
            let mut opt = SGD::new(model.parameters(), args.cnn_lr, args.momentum);
            fit(epochs, &mut model, loss_fn, &mut opt, &train_dl, &valid_dl)?
        }
        Stage::Sequential => {
            let mut model = sequential_cnn(rng);
            let mut opt = SGD::new(model.parameters(), args.cnn_lr, args.momentum);
            fit(epochs, &mut model, loss_fn, &mut opt, &train_dl, &valid_dl)?
        }
        Stage::Wrapped | Stage::All => {
            let train_dl = WrappedDataLoader::new(train_dl, preprocess);
            let valid_dl = WrappedDataLoader::new(valid_dl, preprocess);
            let mut model = sequential_cnn_adaptive(rng);
            let mut opt = SGD::new(model.parameters(), args.cnn_lr, args.momentum);
            let report = fit(epochs, &mut model, loss_fn, &mut opt, &train_dl, &valid_dl)?;
            let (loss, acc) = evaluate(&model, loss_fn, &valid_dl)?;
            log::info!("{}: validation loss {}, accuracy {}", stage, loss, acc);
            return Ok(report.val_losses);
        }
    };
    Ok(report.val_losses)
}

/// The hand-written loop, reporting loss and accuracy on the first batch before and after
fn manual(
    args: &Args,
    train: &TensorDataset,
    valid: &TensorDataset,
    rng: &mut Pcg64Mcg,
) -> Result<Vec<f32>, Box<dyn Error>> {
    let model = ManualLinear::new(rng);
    let (xb, yb) = train.get_range(0..args.batch_size.min(train.len()))?;

    let preds = model.forward(&xb)?;
    log::info!("first batch predictions: {:?}", preds.shape());
    println!("{} {}", nll(&preds, &yb)?.item()?, accuracy(&preds, &yb)?);

    train_manual(&model, train.features(), train.labels(), args.epochs, args.batch_size, args.lr)?;

    let preds = model.forward(&xb)?;
    println!("{} {}", nll(&preds, &yb)?.item()?, accuracy(&preds, &yb)?);

    // one point for the loss chart, since this loop does not validate per epoch
    let valid_dl = DataLoader::new(valid.clone(), 2 * args.batch_size, false)?;
    let val_loss = model.validation_loss(&valid_dl)?;
    log::info!("manual: validation loss {}", val_loss);
    Ok(vec![val_loss])
}

fn create_parent(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<&str, Box<dyn Error>> {
    path.to_str()
        .ok_or_else(|| format!("non UTF-8 path '{}'", path.display()).into())
}
