pub mod checkpoint;
pub mod coloring;
pub mod common;
pub mod conditioning;
pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod logging;
pub mod message;
pub mod model;
pub mod optim;
pub mod train;
pub mod utils;

pub(crate) const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

use crate::{
    common::*,
    config::Config,
    dataset::{prefetch_worker, ChannelLoader, FaciesDatasetInit, ShuffledLoader},
    error::ConfigError,
    logging::{CsvReporter, Reporter, TracingReporter},
    train::TrainerInit,
};
use futures::FutureExt;

/// Check the device, load the dataset and run training to the last step.
pub async fn start(config: Config) -> Result<()> {
    let device = config.training.device;
    if !tch::Cuda::is_available() && !(device == Device::Cpu && config.training.allow_cpu) {
        return Err(ConfigError::AcceleratorUnavailable.into());
    }
    if device == Device::Cpu {
        warn!("training on CPU, expect it to be slow");
    }

    let architecture = config.model.architecture()?;
    config.model.init_method()?;
    config.model.num_blocks()?;
    tch::manual_seed(config.seed as i64);

    // run directory
    let run_dir = config.run_dir();
    tokio::fs::create_dir_all(&run_dir).await?;
    tokio::fs::create_dir_all(config.checkpoint_dir()).await?;
    tokio::fs::create_dir_all(config.sample_dir()).await?;
    config.save(run_dir.join("config.json"))?;
    info!("run directory '{}'", run_dir.display());

    // load dataset
    let dataset = FaciesDatasetInit {
        dir: &config.dataset_path,
        n_classes: config.data.n_classes,
        data_size: config.model.data_size,
    }
    .load()
    .await?;
    let n_classes = dataset.n_classes();
    info!("{} facies classes", n_classes);

    let n_pixels = architecture
        .is_conditional()
        .then(|| config.data.n_pixels.clone());
    let loader = ShuffledLoader::new(
        dataset,
        config.training.batch_size.get(),
        n_pixels,
        config.seed,
    )?;
    let (data_tx, data_rx) = tokio::sync::mpsc::channel(config.data.prefetch.get());

    // data worker
    let data_fut = tokio::task::spawn_blocking(move || prefetch_worker(loader, data_tx))
        .map(|result| Ok::<_, Error>(result??));

    // training worker
    let train_fut = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut trainer = TrainerInit {
            config: &config,
            n_classes,
        }
        .build()?;

        let mut reporters: Vec<Box<dyn Reporter>> = vec![Box::new(TracingReporter)];
        if config.logging.csv {
            reporters.push(Box::new(CsvReporter::new(
                config.run_dir().join("losses.csv"),
            )?));
        }

        let mut loader = ChannelLoader::new(n_classes, data_rx);
        trainer.train(&mut loader, &mut reporters)
    })
    .map(|result| Ok::<_, Error>(result??));

    futures::try_join!(data_fut, train_fut)?;

    Ok(())
}
