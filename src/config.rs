use crate::{common::*, conditioning::PixelCount, error::ConfigError, FILE_STRFTIME};
use chrono::Local;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the run directory under `output_dir`. Defaults to the start time.
    pub run_name: String,
    pub output_dir: PathBuf,
    pub dataset_path: PathBuf,
    pub seed: u64,
    /// Restore generator and discriminator from the checkpoint saved at this step.
    pub recover_model_step: Option<usize>,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub save: SaveConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        Ok(config)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_name)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join("models")
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.run_dir().join("samples")
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_name: format!("{}", Local::now().format(FILE_STRFTIME)),
            output_dir: PathBuf::from("res"),
            dataset_path: PathBuf::from("datasets/facies"),
            seed: 0,
            recover_model_step: None,
            model: Default::default(),
            training: Default::default(),
            data: Default::default(),
            save: Default::default(),
            logging: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Sagan,
    CondSagan,
}

impl Architecture {
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::CondSagan)
    }
}

impl FromStr for Architecture {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "sagan" => Ok(Self::Sagan),
            "cond_sagan" => Ok(Self::CondSagan),
            _ => Err(ConfigError::UnknownArchitecture(name.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitMethod {
    Default,
    Orthogonal,
    Glorot,
    Normal,
}

impl FromStr for InitMethod {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "default" => Ok(Self::Default),
            "orthogonal" => Ok(Self::Orthogonal),
            "glorot" => Ok(Self::Glorot),
            "normal" => Ok(Self::Normal),
            _ => Err(ConfigError::UnknownInitMethod(name.to_owned())),
        }
    }
}

/// Architecture description shared by the generator and the discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// One of `sagan`, `cond_sagan`.
    pub architecture: String,
    /// Spatial size of the facies maps, one of 32, 64, 128, 256.
    pub data_size: usize,
    pub z_dim: usize,
    pub g_conv_dim: usize,
    pub d_conv_dim: usize,
    /// Per-block channel multipliers of the generator, `num_blocks - 1` entries.
    pub g_channels_mult: Option<Vec<usize>>,
    /// Per-block channel multipliers of the discriminator, `num_blocks - 1` entries.
    pub d_channels_mult: Option<Vec<usize>>,
    /// 1-based indices of the blocks followed by a self-attention layer.
    pub attn_layer_num: Vec<usize>,
    /// Query/key projection width. Defaults to a eighth of the feature channels.
    pub attn_qk_dim: Option<usize>,
    /// Project values to the full feature width instead of half of it.
    pub full_values: bool,
    /// One of `default`, `orthogonal`, `glorot`, `normal`.
    pub init_method: String,
}

impl ModelConfig {
    pub fn architecture(&self) -> Result<Architecture, ConfigError> {
        self.architecture.parse()
    }

    pub fn init_method(&self) -> Result<InitMethod, ConfigError> {
        self.init_method.parse()
    }

    /// Number of up/down-sampling blocks, including the final convolution.
    pub fn num_blocks(&self) -> Result<usize, ConfigError> {
        match self.data_size {
            32 => Ok(4),
            64 => Ok(5),
            128 => Ok(6),
            256 => Ok(7),
            size => Err(ConfigError::UnsupportedResolution(size)),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: "sagan".into(),
            data_size: 64,
            z_dim: 128,
            g_conv_dim: 64,
            d_conv_dim: 64,
            g_channels_mult: None,
            d_channels_mult: None,
            attn_layer_num: vec![3],
            attn_qk_dim: None,
            full_values: true,
            init_method: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvLoss {
    #[serde(rename = "wgan-gp")]
    WGanGp,
    #[serde(rename = "hinge")]
    Hinge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    /// Run on a CPU device instead of failing at startup.
    pub allow_cpu: bool,
    pub batch_size: NonZeroUsize,
    pub total_step: usize,
    /// Discriminator updates per generator update.
    pub d_iters: NonZeroUsize,
    pub g_lr: R64,
    pub d_lr: R64,
    pub beta1: R64,
    pub beta2: R64,
    pub adv_loss: AdvLoss,
    /// Gradient penalty coefficient, only used with the Wasserstein loss.
    pub lambda_gp: R64,
    pub mixed_precision: bool,
    pub ema_start_step: usize,
    pub ema_decay: R64,
    /// Weight of the observed-pixel penalty in conditional mode.
    pub cond_penalty: R64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            device: Device::Cuda(0),
            allow_cpu: false,
            batch_size: NonZeroUsize::new(64).unwrap(),
            total_step: 100_000,
            d_iters: NonZeroUsize::new(1).unwrap(),
            g_lr: r64(1e-4),
            d_lr: r64(4e-4),
            beta1: r64(0.0),
            beta2: r64(0.9),
            adv_loss: AdvLoss::WGanGp,
            lambda_gp: r64(10.0),
            mixed_precision: false,
            ema_start_step: 0,
            ema_decay: r64(0.999),
            cond_penalty: r64(1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of facies classes. Inferred from the dataset when absent.
    pub n_classes: Option<usize>,
    /// Observed pixels per map in conditional mode.
    pub n_pixels: PixelCount,
    /// Number of batches buffered ahead of the training loop.
    pub prefetch: NonZeroUsize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n_classes: None,
            n_pixels: PixelCount::Range([5, 20]),
            prefetch: NonZeroUsize::new(2).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub model_step: Option<NonZeroUsize>,
    pub sample_step: Option<NonZeroUsize>,
    pub sample_with_ema: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            model_step: NonZeroUsize::new(5000),
            sample_step: NonZeroUsize::new(500),
            sample_with_ema: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_step: Option<NonZeroUsize>,
    /// Append losses to `<run>/losses.csv`.
    pub csv: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_step: NonZeroUsize::new(100),
            csv: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_count_lookup_test() -> Result<()> {
        for (size, expect) in [(32, 4), (64, 5), (128, 6), (256, 7)] {
            let config = ModelConfig {
                data_size: size,
                ..Default::default()
            };
            assert_eq!(config.num_blocks()?, expect);
        }

        let config = ModelConfig {
            data_size: 48,
            ..Default::default()
        };
        assert!(matches!(
            config.num_blocks(),
            Err(ConfigError::UnsupportedResolution(48))
        ));
        Ok(())
    }

    #[test]
    fn parse_names_test() {
        assert_eq!("cond_sagan".parse::<Architecture>().ok(), Some(Architecture::CondSagan));
        let err = "stylegan".parse::<Architecture>().unwrap_err();
        assert!(err.to_string().contains("stylegan"));
        assert!(err.to_string().contains("not implemented"));

        assert_eq!("glorot".parse::<InitMethod>().ok(), Some(InitMethod::Glorot));
        let err = "xavier".parse::<InitMethod>().unwrap_err();
        assert!(err.to_string().contains("xavier"));
    }

    #[test]
    fn load_json5_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json5");
        fs::write(
            &path,
            r#"{
                // partial config, the rest falls back to defaults
                run_name: "unit",
                recover_model_step: 8,
                model: { data_size: 32, attn_layer_num: [2, 3] },
                training: { adv_loss: "hinge", ema_decay: 0.99 },
                data: { n_pixels: 10 },
            }"#,
        )?;

        let config = Config::load(&path)?;
        assert_eq!(config.run_name, "unit");
        assert_eq!(config.recover_model_step, Some(8));
        assert_eq!(config.model.data_size, 32);
        assert_eq!(config.model.attn_layer_num, vec![2, 3]);
        assert_eq!(config.model.z_dim, 128);
        assert_eq!(config.training.ema_decay, r64(0.99));
        assert_eq!(config.training.adv_loss, AdvLoss::Hinge);
        assert_eq!(config.data.n_pixels, PixelCount::Fixed(10));
        assert_eq!(config.checkpoint_dir(), PathBuf::from("res/unit/models"));
        Ok(())
    }
}
