use crate::{
    common::*,
    conditioning::{pixel_maps_from_data, PixelCount},
    message::Batch,
};
use tokio::sync::mpsc;

/// Supplier of training batches.
pub trait DataLoader: Send {
    fn n_classes(&self) -> usize;
    fn next_batch(&mut self) -> Result<Batch>;
}

#[derive(Debug, Clone)]
pub struct FaciesDatasetInit<P>
where
    P: AsRef<Path>,
{
    pub dir: P,
    /// Number of classes. Inferred as the maximum index + 1 when absent.
    pub n_classes: Option<usize>,
    pub data_size: usize,
}

impl<P> FaciesDatasetInit<P>
where
    P: AsRef<Path>,
{
    /// Load every `*.png` in `dir`; the first image channel holds the class index.
    pub async fn load(self) -> Result<FaciesDataset> {
        let Self {
            dir,
            n_classes,
            data_size,
        } = self;
        let dir = dir.as_ref().to_owned();

        let pattern = dir.join("*.png");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| format_err!("non-UTF-8 path '{}'", dir.display()))?
            .to_owned();
        let paths: Vec<PathBuf> = glob::glob(&pattern)?.try_collect()?;
        let paths: Vec<_> = paths.into_iter().sorted().collect();
        ensure!(
            !paths.is_empty(),
            "no png files found in '{}'",
            dir.display()
        );
        info!("{} facies maps found in '{}'", paths.len(), dir.display());

        let classes = tokio::task::spawn_blocking(move || -> Result<_> {
            let maps: Vec<_> = paths
                .iter()
                .map(|path| load_class_map(path, data_size))
                .try_collect()?;
            Ok(Tensor::stack(&maps, 0))
        })
        .await??;

        let max_index = i64::from(classes.max()) as usize;
        let n_classes = match n_classes {
            Some(n_classes) => {
                ensure!(
                    max_index < n_classes,
                    "class index {} found, but n_classes is {}",
                    max_index,
                    n_classes
                );
                n_classes
            }
            None => max_index + 1,
        };

        Ok(FaciesDataset { classes, n_classes })
    }
}

fn load_class_map(path: &Path, data_size: usize) -> Result<Tensor> {
    let image = tch::vision::image::load(path)
        .with_context(|| format!("unable to load image '{}'", path.display()))?;
    let (_channels, height, width) = image.size3()?;
    ensure!(
        height == data_size as i64 && width == data_size as i64,
        "'{}' has size {}x{}, but data_size is {}",
        path.display(),
        height,
        width,
        data_size
    );
    Ok(image.select(0, 0).to_kind(Kind::Int64))
}

/// Class-index maps held in memory as `[N, R, R]`.
#[derive(Debug)]
pub struct FaciesDataset {
    classes: Tensor,
    n_classes: usize,
}

impl FaciesDataset {
    pub fn from_classes(classes: Tensor, n_classes: usize) -> Result<Self> {
        let (_, height, width) = classes.size3()?;
        ensure!(height == width, "expect square maps");
        ensure!(
            (i64::from(classes.max()) as usize) < n_classes,
            "class index exceeds n_classes"
        );
        Ok(Self {
            classes: classes.to_kind(Kind::Int64),
            n_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.classes.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// One-hot maps `[B, n_classes, R, R]` of the selected samples.
    pub fn one_hot(&self, indices: &[i64]) -> Tensor {
        let indices = Tensor::of_slice(indices);
        self.classes
            .index_select(0, &indices)
            .one_hot(self.n_classes as i64)
            .permute(&[0, 3, 1, 2])
            .to_kind(Kind::Float)
    }
}

/// Cycles over the dataset in shuffled epochs.
#[derive(Debug)]
pub struct ShuffledLoader {
    dataset: FaciesDataset,
    batch_size: usize,
    n_pixels: Option<PixelCount>,
    rng: StdRng,
    order: Vec<i64>,
    cursor: usize,
    batch_index: usize,
}

impl ShuffledLoader {
    /// Batches carry pixel maps sampled from the data when `n_pixels` is set.
    pub fn new(
        dataset: FaciesDataset,
        batch_size: usize,
        n_pixels: Option<PixelCount>,
        seed: u64,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(!dataset.is_empty(), "empty dataset is not allowed");
        let order = (0..dataset.len() as i64).collect();

        let mut loader = Self {
            dataset,
            batch_size,
            n_pixels,
            rng: StdRng::seed_from_u64(seed),
            order,
            cursor: 0,
            batch_index: 0,
        };
        loader.order.shuffle(&mut loader.rng);
        Ok(loader)
    }
}

impl DataLoader for ShuffledLoader {
    fn n_classes(&self) -> usize {
        self.dataset.n_classes()
    }

    fn next_batch(&mut self) -> Result<Batch> {
        let mut indices = Vec::with_capacity(self.batch_size);
        while indices.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }

        let data = self.dataset.one_hot(&indices);
        let pixel_maps = self
            .n_pixels
            .as_ref()
            .map(|n_pixels| pixel_maps_from_data(&mut self.rng, &data, n_pixels))
            .transpose()?;

        let batch = Batch {
            data,
            pixel_maps,
            batch_index: self.batch_index,
        };
        self.batch_index += 1;
        Ok(batch)
    }
}

/// Consumes batches produced by [prefetch_worker] on another thread.
#[derive(Debug)]
pub struct ChannelLoader {
    n_classes: usize,
    rx: mpsc::Receiver<Batch>,
}

impl ChannelLoader {
    pub fn new(n_classes: usize, rx: mpsc::Receiver<Batch>) -> Self {
        Self { n_classes, rx }
    }
}

impl DataLoader for ChannelLoader {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn next_batch(&mut self) -> Result<Batch> {
        self.rx
            .blocking_recv()
            .ok_or_else(|| format_err!("the data worker stopped"))
    }
}

/// Feed batches into `tx` until the receiving side is dropped.
pub fn prefetch_worker(mut loader: impl DataLoader, tx: mpsc::Sender<Batch>) -> Result<()> {
    loop {
        let batch = loader.next_batch()?;
        if tx.blocking_send(batch).is_err() {
            debug!("data receiver dropped, stop prefetching");
            break;
        }
    }
    Ok(())
}
