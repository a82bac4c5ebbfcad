use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One training batch: `[B, C, H, W]` images plus optional class labels.
/// Produced by the data source, consumed once per step, never mutated.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous slice `[offset, offset + len)` along the batch dimension.
    pub fn narrow(&self, offset: usize, len: usize) -> Result<Batch> {
        let images = self
            .images
            .narrow(0, offset, len)
            .map_err(|err| TrainingError::runtime(format!("failed to slice batch: {err}")))?;
        let labels = match &self.labels {
            Some(labels) => Some(labels.narrow(0, offset, len).map_err(|err| {
                TrainingError::runtime(format!("failed to slice batch labels: {err}"))
            })?),
            None => None,
        };
        Ok(Batch { images, labels })
    }
}

/// Asynchronous-compatible loader abstraction. The trainer only ever sees
/// this seam, so a prefetching source can be swapped in without touching
/// the step loop.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;
}

/// Blocking adapter around an async-friendly loader. The trainer suspends
/// here until a batch is available; a stalled source stalls training.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }
}

/// Lazy microbatch splitter.
///
/// Covers the batch exactly once with contiguous slices of at most `limit`
/// examples, each tagged with `weight = slice_len / batch_len` so the
/// weights sum to 1.0. A limit of `None` (or one at least as large as the
/// batch) yields the whole batch once with weight 1.0.
pub struct Microbatches<'a> {
    batch: &'a Batch,
    limit: usize,
    offset: usize,
}

impl<'a> Microbatches<'a> {
    pub fn new(batch: &'a Batch, limit: Option<usize>) -> Self {
        let batch_len = batch.len();
        let limit = match limit {
            Some(limit) if limit > 0 && limit < batch_len => limit,
            _ => batch_len.max(1),
        };
        Self {
            batch,
            limit,
            offset: 0,
        }
    }
}

impl<'a> Iterator for Microbatches<'a> {
    type Item = Result<(Batch, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.batch.len();
        if self.offset >= total {
            return None;
        }
        let len = self.limit.min(total - self.offset);
        let weight = len as f64 / total as f64;
        let slice = self.batch.narrow(self.offset, len);
        self.offset += len;
        Some(slice.map(|micro| (micro, weight)))
    }
}

/// Streaming loader over raw sketch shards.
///
/// Each `<category>.bin` file in the data directory holds little-endian
/// f32 records of `image_size * image_size` values. Records are shuffled
/// per pass with a seeded RNG and the shard list restarts indefinitely;
/// the trainer never observes an epoch boundary.
#[derive(Debug)]
pub struct SketchDataLoader {
    shards: Vec<ShardSource>,
    image_size: usize,
    batch_size: usize,
    class_cond: bool,
    device: Device,
    rng: StdRng,
    // (shard index, record index) queue for the current pass.
    pending: Vec<(usize, usize)>,
    // Decoded shard contents, filled lazily and kept resident so the
    // globally-shuffled record order never re-reads a file.
    cache: Vec<Option<Vec<f32>>>,
}

#[derive(Debug)]
struct ShardSource {
    path: PathBuf,
    label: u32,
    records: usize,
}

/// Opens the sketch dataset the trainer streams from.
///
/// `categories` selects shard files by stem; an empty list selects every
/// `.bin` shard in the directory.
pub fn load_data(
    data_dir: &Path,
    categories: &[String],
    image_size: usize,
    batch_size: usize,
    class_cond: bool,
    seed: u64,
    device: Device,
) -> Result<SketchDataLoader> {
    if !data_dir.is_dir() {
        return Err(TrainingError::initialization(format!(
            "dataset path {} not found",
            data_dir.display()
        )));
    }

    let record_len = image_size * image_size;
    let mut shards = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(data_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("bin"))
        .collect();
    entries.sort();

    for path in entries {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        if !categories.is_empty() && !categories.iter().any(|c| c == &stem) {
            continue;
        }
        let bytes = path.metadata()?.len() as usize;
        if bytes % (record_len * 4) != 0 {
            return Err(TrainingError::initialization(format!(
                "shard {} is not a whole number of {}x{} records",
                path.display(),
                image_size,
                image_size
            )));
        }
        let records = bytes / (record_len * 4);
        if records == 0 {
            continue;
        }
        let label = shards.len() as u32;
        shards.push(ShardSource {
            path,
            label,
            records,
        });
    }

    if shards.is_empty() {
        return Err(TrainingError::initialization(format!(
            "no sketch shards found under {}",
            data_dir.display()
        )));
    }

    let cache = shards.iter().map(|_| None).collect();
    let mut loader = SketchDataLoader {
        shards,
        image_size,
        batch_size,
        class_cond,
        device,
        rng: StdRng::seed_from_u64(seed),
        pending: Vec::new(),
        cache,
    };
    loader.start_pass();
    Ok(loader)
}

impl SketchDataLoader {
    /// Number of distinct category labels the loader emits.
    pub fn num_classes(&self) -> usize {
        self.shards.len()
    }

    fn start_pass(&mut self) {
        self.pending.clear();
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            for record in 0..shard.records {
                self.pending.push((shard_idx, record));
            }
        }
        self.pending.shuffle(&mut self.rng);
        // Pop from the back; reverse so the shuffled order is preserved.
        self.pending.reverse();
    }

    fn read_record(&mut self, shard_idx: usize, record: usize) -> Result<Vec<f32>> {
        let record_len = self.image_size * self.image_size;
        if self.cache[shard_idx].is_none() {
            let path = &self.shards[shard_idx].path;
            let mut bytes = Vec::new();
            File::open(path)?.read_to_end(&mut bytes)?;
            let values = bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            self.cache[shard_idx] = Some(values);
        }
        let values = self.cache[shard_idx].as_ref().ok_or_else(|| {
            TrainingError::runtime("shard cache unexpectedly empty".to_string())
        })?;
        let start = record * record_len;
        let end = start + record_len;
        if end > values.len() {
            return Err(TrainingError::runtime(format!(
                "record {record} out of range in shard {}",
                self.shards[shard_idx].path.display()
            )));
        }
        Ok(values[start..end].to_vec())
    }

    fn build_batch(&mut self) -> Result<Option<Batch>> {
        let record_len = self.image_size * self.image_size;
        let mut values = Vec::with_capacity(self.batch_size * record_len);
        let mut labels = Vec::with_capacity(self.batch_size);

        while labels.len() < self.batch_size {
            let (shard_idx, record) = match self.pending.pop() {
                Some(next) => next,
                None => {
                    // Restartable source: begin the next pass in place.
                    self.start_pass();
                    match self.pending.pop() {
                        Some(next) => next,
                        None => {
                            return Err(TrainingError::runtime(
                                "data source exhausted and did not restart",
                            ))
                        }
                    }
                }
            };
            values.extend(self.read_record(shard_idx, record)?);
            labels.push(self.shards[shard_idx].label);
        }

        let images = Tensor::from_vec(
            values,
            (self.batch_size, 1, self.image_size, self.image_size),
            &self.device,
        )
        .map_err(|err| {
            TrainingError::runtime(format!("failed to materialize image tensor: {err}"))
        })?;

        let labels = if self.class_cond {
            Some(
                Tensor::from_vec(labels, self.batch_size, &self.device).map_err(|err| {
                    TrainingError::runtime(format!("failed to materialize label tensor: {err}"))
                })?,
            )
        } else {
            None
        };

        Ok(Some(Batch { images, labels }))
    }
}

impl DataLoader for SketchDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { self.build_batch() })
    }
}
