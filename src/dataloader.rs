//! Datasets and data loaders
//!
//! Takes inspiration from `torch.utils.data`: a [`Dataset`] is an indexable pair of aligned
//! features and labels, a [`Loader`] turns one into a restartable sequence of batches.
//! <https://pytorch.org/docs/stable/data.html>

use std::{cell::RefCell, ops::Range};

use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// A `(features, labels)` pair
pub type Batch = (Tensor, Tensor);

/// Errors for datasets and the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Features and labels need a leading sample dimension, got {shape:?}")]
    MissingSampleDimension { shape: Vec<usize> },
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Represents torch.utils.data.Dataset for map-style datasets of aligned samples
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A single sample, without the leading sample dimension
    fn get(&self, index: usize) -> Result<Batch, TensorError>;

    /// A contiguous range of samples
    fn get_range(&self, range: Range<usize>) -> Result<Batch, TensorError>;

    /// The given samples, in the given order
    fn get_many(&self, indices: &[usize]) -> Result<Batch, TensorError>;
}

/// Dataset wrapping a features tensor and a labels tensor, indexed along their first dimension
#[derive(Debug, Clone)]
pub struct TensorDataset {
    x: Tensor,
    y: Tensor,
}

impl TensorDataset {
    pub fn new(x: Tensor, y: Tensor) -> Result<Self, DataLoaderError> {
        for t in [&x, &y] {
            if t.shape().is_empty() {
                return Err(DataLoaderError::MissingSampleDimension { shape: t.shape() });
            }
        }
        if x.len() != y.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: y.len(),
                data_len: x.len(),
            });
        }
        Ok(Self { x, y })
    }

    /// The first `n` samples (all of them if there are fewer)
    pub fn head(&self, n: usize) -> Result<Self, TensorError> {
        let (x, y) = self.get_range(0..n.min(self.len()))?;
        Ok(Self { x, y })
    }

    pub fn features(&self) -> &Tensor {
        &self.x
    }

    pub fn labels(&self) -> &Tensor {
        &self.y
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.x.len()
    }

    fn get(&self, index: usize) -> Result<Batch, TensorError> {
        let (x, y) = self.get_range(index..index + 1)?;
        Ok((drop_leading_dim(&x)?, drop_leading_dim(&y)?))
    }

    fn get_range(&self, range: Range<usize>) -> Result<Batch, TensorError> {
        Ok((self.x.narrow_rows(range.clone())?, self.y.narrow_rows(range)?))
    }

    fn get_many(&self, indices: &[usize]) -> Result<Batch, TensorError> {
        Ok((self.x.select_rows(indices)?, self.y.select_rows(indices)?))
    }
}

fn drop_leading_dim(t: &Tensor) -> Result<Tensor, TensorError> {
    let shape = t.shape();
    Tensor::new(t.data(), &shape[1..])
}

/// Anything that yields a finite, restartable sequence of batches
pub trait Loader {
    /// Number of batches in one pass
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a new pass over the data
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, TensorError>> + '_>;
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    // reshuffles on every pass, hence behind a RefCell
    rng: RefCell<Pcg64Mcg>,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, shuffle: bool) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::InvalidBatchSize);
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: RefCell::new(Pcg64Mcg::from_rng(&mut rand::rng())),
        })
    }

    /// Makes the shuffling order reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn iter(&self) -> DataLoaderIterator<'_, D> {
        let mut indices = (0..self.dataset.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut *self.rng.borrow_mut());
        }
        DataLoaderIterator {
            dataset: &self.dataset,
            batch_size: self.batch_size,
            shuffled: self.shuffle,
            indices,
            curr_iter: 0,
        }
    }
}

impl<D: Dataset> Loader for DataLoader<D> {
    fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, TensorError>> + '_> {
        Box::new(self.iter())
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset.
/// The last batch holds the remainder if the dataset size is not a multiple of the batch size.
pub struct DataLoaderIterator<'a, D> {
    dataset: &'a D,
    batch_size: usize,
    shuffled: bool,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<D: Dataset> Iterator for DataLoaderIterator<'_, D> {
    type Item = Result<Batch, TensorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch = if self.shuffled {
            self.dataset.get_many(&self.indices[self.curr_iter..end])
        } else {
            self.dataset.get_range(self.curr_iter..end)
        };
        self.curr_iter = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.indices.len() - self.curr_iter).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

type TransformFn = dyn Fn(Batch) -> Result<Batch, TensorError>;

/// Applies a transform to every batch of the wrapped loader
pub struct WrappedDataLoader<L> {
    loader: L,
    func: Box<TransformFn>,
}

impl<L: Loader> WrappedDataLoader<L> {
    pub fn new<F>(loader: L, func: F) -> Self
    where
        F: Fn(Batch) -> Result<Batch, TensorError> + 'static,
    {
        Self {
            loader,
            func: Box::new(func),
        }
    }

    pub fn inner(&self) -> &L {
        &self.loader
    }
}

impl<L: Loader> Loader for WrappedDataLoader<L> {
    fn len(&self) -> usize {
        self.loader.len()
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch, TensorError>> + '_> {
        Box::new(
            self.loader
                .batches()
                .map(move |batch| batch.and_then(|batch| (self.func)(batch))),
        )
    }
}

/// A shuffled training loader and an ordered validation loader with twice the batch size,
/// since validation needs no gradients and thus less memory per sample
pub fn get_data<D: Dataset>(
    train_ds: D,
    valid_ds: D,
    batch_size: usize,
) -> Result<(DataLoader<D>, DataLoader<D>), DataLoaderError> {
    Ok((
        DataLoader::new(train_ds, batch_size, true)?,
        DataLoader::new(valid_ds, batch_size * 2, false)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sample `i` has features `[i, 10 i]` and label `i % 3`
    fn dataset(n: usize) -> TensorDataset {
        let x = (0..n).flat_map(|i| [i as f32, 10.0 * i as f32]).collect();
        let y = (0..n).map(|i| (i % 3) as f32).collect();
        TensorDataset::new(
            Tensor::new(x, &[n, 2]).unwrap(),
            Tensor::new(y, &[n]).unwrap(),
        )
        .unwrap()
    }

    fn sample_ids(loader: &dyn Loader) -> Vec<usize> {
        loader
            .batches()
            .flat_map(|batch| {
                let (x, _) = batch.unwrap();
                x.data().chunks(2).map(|row| row[0] as usize).collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_dataset_indexing() {
        let ds = dataset(5);
        assert_eq!(ds.len(), 5);
        let (x, y) = ds.get(3).unwrap();
        assert_eq!(x.shape(), vec![2]);
        assert_eq!(x.data(), vec![3.0, 30.0]);
        assert_eq!(y.shape(), Vec::<usize>::new());
        assert_eq!(y.item().unwrap(), 0.0);

        let (x, y) = ds.get_range(1..3).unwrap();
        assert_eq!(x.data(), vec![1.0, 10.0, 2.0, 20.0]);
        assert_eq!(y.data(), vec![1.0, 2.0]);
        assert!(ds.get(5).is_err());
    }

    #[test]
    fn test_dataloader() {
        let data_loader = DataLoader::new(dataset(2), 2, false).unwrap();
        let mut iter = data_loader.iter();
        assert_eq!(
            iter.next().unwrap().unwrap(),
            (
                Tensor::new(vec![0.0, 0.0, 1.0, 10.0], &[2, 2]).unwrap(),
                Tensor::new(vec![0.0, 1.0], &[2]).unwrap(),
            )
        );
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_ordered_pass_reconstructs_dataset() {
        let data_loader = DataLoader::new(dataset(10), 4, false).unwrap();
        assert_eq!(sample_ids(&data_loader), (0..10).collect::<Vec<_>>());
        // restartable
        assert_eq!(sample_ids(&data_loader), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffled_pass_is_permutation() {
        let data_loader = DataLoader::new(dataset(50), 8, true).unwrap().with_seed(42);
        let ids = sample_ids(&data_loader);
        assert_ne!(ids, (0..50).collect::<Vec<_>>());
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());

        // labels stay aligned with their features
        for batch in data_loader.iter() {
            let (x, y) = batch.unwrap();
            for (row, label) in x.data().chunks(2).zip(y.data()) {
                assert_eq!((row[0] as usize % 3) as f32, label);
                assert_eq!(row[1], 10.0 * row[0]);
            }
        }
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let first = DataLoader::new(dataset(30), 7, true).unwrap().with_seed(3);
        let second = DataLoader::new(dataset(30), 7, true).unwrap().with_seed(3);
        assert_eq!(sample_ids(&first), sample_ids(&second));
        assert_eq!(sample_ids(&first), sample_ids(&second));
    }

    #[test]
    fn test_batch_sizes() {
        let data_loader = DataLoader::new(dataset(10), 4, true).unwrap();
        let sizes = data_loader
            .iter()
            .map(|b| b.unwrap().0.len())
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(Loader::len(&data_loader), 3);
        assert_eq!(data_loader.iter().size_hint(), (3, Some(3)));

        let exact = DataLoader::new(dataset(8), 4, false).unwrap();
        let sizes = exact.iter().map(|b| b.unwrap().0.len()).collect::<Vec<_>>();
        assert_eq!(sizes, vec![4, 4]);
    }

    #[test]
    fn test_wrapped_dataloader() {
        let data_loader = DataLoader::new(dataset(6), 4, false).unwrap();
        let wrapped = WrappedDataLoader::new(data_loader, |(x, y): Batch| {
            Ok((x.view(&[-1, 1, 1, 2])?, y))
        });
        assert_eq!(wrapped.len(), 2);
        let shapes = wrapped
            .batches()
            .map(|b| b.unwrap().0.shape())
            .collect::<Vec<_>>();
        assert_eq!(shapes, vec![vec![4, 1, 1, 2], vec![2, 1, 1, 2]]);
        assert_eq!(sample_ids(&wrapped), (0..6).collect::<Vec<_>>());
        assert_eq!(wrapped.inner().batch_size(), 4);
    }

    #[test]
    fn test_get_data() {
        let (train_dl, valid_dl) = get_data(dataset(10), dataset(10), 3).unwrap();
        assert_eq!(train_dl.batch_size(), 3);
        assert_eq!(valid_dl.batch_size(), 6);
        assert_eq!(sample_ids(&valid_dl), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_dataloader_errors() {
        // different length data and labels
        let x = Tensor::zeros(&[2, 3]);
        let y = Tensor::zeros(&[3]);
        assert!(matches!(
            TensorDataset::new(x, y),
            Err(DataLoaderError::LabelLengthMismatch {
                label_len: 3,
                data_len: 2,
            })
        ));
        assert!(matches!(
            TensorDataset::new(Tensor::scalar(1.0), Tensor::zeros(&[1])),
            Err(DataLoaderError::MissingSampleDimension { .. })
        ));
        assert!(matches!(
            DataLoader::new(dataset(3), 0, false),
            Err(DataLoaderError::InvalidBatchSize)
        ));
    }
}
