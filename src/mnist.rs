//! Fetches and decodes the MNIST archive
//!
//! The archive is a gzip compressed pickle of `((x_train, y_train), (x_valid, y_valid),
//! (x_test, y_test))` numpy arrays: images are `float32` rows of 784 pixels in `[0, 1]`,
//! labels are `int64` digits.

use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use thiserror::Error;

use crate::{
    dataloader::{DataLoaderError, TensorDataset},
    models::{N_CLASSES, N_PIXELS},
    pickle::{self, NdArray, Object, PickleError},
    tensor::{Tensor, TensorError},
};

pub const URL: &str = "https://github.com/pytorch/tutorials/raw/main/_static/";
pub const FILENAME: &str = "mnist.pkl.gz";
/// Subdirectory of the data root holding the archive
pub const DIR: &str = "mnist";

/// Errors for fetching and decoding the archive
#[derive(Debug, Error)]
pub enum MnistError {
    #[error("Failed to download '{url}': {reason}")]
    Http { url: String, reason: String },
    #[error("Malformed archive: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Pickle(#[from] PickleError),
    #[error(transparent)]
    DataLoader(#[from] DataLoaderError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// The three splits of the archive, features `[n, 784]` and labels `[n]`
#[derive(Debug, Clone)]
pub struct MnistSplits {
    pub train: TensorDataset,
    pub valid: TensorDataset,
    pub test: TensorDataset,
}

/// Where the archive lives under `root`
pub fn archive_path(root: &Path) -> PathBuf {
    root.join(DIR).join(FILENAME)
}

/// Downloads `url` to `path` unless the file is already there.
/// Returns whether a download happened.
pub fn download(url: &str, path: &Path) -> Result<bool, MnistError> {
    if path.exists() {
        log::info!("Using cached '{}'", path.display());
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    log::info!("Downloading '{}'", url);
    let response = ureq::get(url).call().map_err(|e| MnistError::Http {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    // a failed transfer leaves only the partial file behind, never `path`
    let partial = path.with_extension("part");
    let mut file = File::create(&partial)?;
    let n_bytes = io::copy(&mut response.into_reader(), &mut file)?;
    file.sync_all()?;
    fs::rename(&partial, path)?;
    log::info!("Saved {} bytes to '{}'", n_bytes, path.display());
    Ok(true)
}

/// Makes sure the archive is cached under `root` and returns its path
pub fn ensure_dataset(root: &Path) -> Result<PathBuf, MnistError> {
    let path = archive_path(root);
    download(&format!("{}{}", URL, FILENAME), &path)?;
    Ok(path)
}

/// Decompresses and decodes the archive at `path`
pub fn load(path: &Path) -> Result<MnistSplits, MnistError> {
    let decoder = GzDecoder::new(BufReader::new(File::open(path)?));
    let root = pickle::from_reader(decoder)?;
    let splits = root
        .as_tuple()
        .filter(|s| s.len() == 3)
        .ok_or_else(|| MnistError::Format("expected a tuple of three splits".to_string()))?;

    let splits = MnistSplits {
        train: split(&splits[0], "train")?,
        valid: split(&splits[1], "valid")?,
        test: split(&splits[2], "test")?,
    };
    log::info!(
        "Loaded {} training, {} validation and {} test samples",
        splits.train.features().len(),
        splits.valid.features().len(),
        splits.test.features().len()
    );
    Ok(splits)
}

fn split(obj: &Object, name: &str) -> Result<TensorDataset, MnistError> {
    let format = |what: &str| MnistError::Format(format!("{} split: {}", name, what));
    let [x, y] = obj.as_tuple().ok_or_else(|| format("not a tuple"))? else {
        return Err(format("expected (images, labels)"));
    };
    let x = x.as_ndarray().ok_or_else(|| format("images are not an array"))?;
    let y = y.as_ndarray().ok_or_else(|| format("labels are not an array"))?;

    let [n, n_pixels] = x.shape[..] else {
        return Err(format("images must be two dimensional"));
    };
    if n_pixels != N_PIXELS {
        return Err(format(&format!("expected {} pixels per image, got {}", N_PIXELS, n_pixels)));
    }
    if y.shape != [n] {
        return Err(format(&format!("{} images but labels of shape {:?}", n, y.shape)));
    }

    let labels = labels(y)?;
    if let Some(bad) = labels.iter().find(|&&l| l < 0 || l >= N_CLASSES as i64) {
        return Err(format(&format!("label {} out of range", bad)));
    }
    let x = Tensor::new(x.to_f32()?, &[n, N_PIXELS])?;
    let y = Tensor::new(labels.into_iter().map(|l| l as f32).collect(), &[n])?;
    Ok(TensorDataset::new(x, y)?)
}

fn labels(y: &NdArray) -> Result<Vec<i64>, MnistError> {
    match y.dtype.kind {
        'i' | 'u' => Ok(y.to_i64()?),
        kind => Err(MnistError::Format(format!("labels of kind '{}'", kind))),
    }
}
