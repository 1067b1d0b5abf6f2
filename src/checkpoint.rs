//! Per-step checkpoint files under `<run>/models/`.

use crate::{common::*, error::CheckpointError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointRole {
    Generator,
    Discriminator,
    EmaGenerator,
    Optimizers,
}

impl CheckpointRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Discriminator => "discriminator",
            Self::EmaGenerator => "ema_generator",
            Self::Optimizers => "optimizers",
        }
    }
}

pub fn checkpoint_path(dir: impl AsRef<Path>, role: CheckpointRole, step: usize) -> PathBuf {
    dir.as_ref()
        .join(format!("{}_step_{}.ot", role.name(), step))
}

/// Write through a temporary file so an interrupted save leaves earlier files intact.
fn write_atomic(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    write(&tmp_path)?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "unable to move '{}' to '{}'",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn save_var_store(
    vs: &nn::VarStore,
    dir: impl AsRef<Path>,
    role: CheckpointRole,
    step: usize,
) -> Result<PathBuf> {
    let path = checkpoint_path(dir, role, step);
    write_atomic(&path, |tmp_path| {
        vs.save(tmp_path)
            .with_context(|| format!("unable to save '{}'", tmp_path.display()))
    })?;
    Ok(path)
}

pub fn save_tensors(
    tensors: &[(String, Tensor)],
    dir: impl AsRef<Path>,
    role: CheckpointRole,
    step: usize,
) -> Result<PathBuf> {
    let path = checkpoint_path(dir, role, step);
    let named: Vec<_> = tensors
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();
    write_atomic(&path, |tmp_path| {
        Tensor::save_multi(&named, tmp_path)
            .with_context(|| format!("unable to save '{}'", tmp_path.display()))
    })?;
    Ok(path)
}

/// Load a required file, failing with [CheckpointError::Missing] when absent.
pub fn load_var_store(
    vs: &mut nn::VarStore,
    dir: impl AsRef<Path>,
    role: CheckpointRole,
    step: usize,
) -> Result<()> {
    let path = checkpoint_path(dir, role, step);
    if !path.is_file() {
        return Err(CheckpointError::Missing {
            role: role.name(),
            step,
            path,
        }
        .into());
    }
    vs.load(&path)
        .with_context(|| format!("unable to load '{}'", path.display()))?;
    info!("loaded {} weights from '{}'", role.name(), path.display());
    Ok(())
}

/// Load an optional file. Returns false and warns when absent.
pub fn load_var_store_optional(
    vs: &mut nn::VarStore,
    dir: impl AsRef<Path>,
    role: CheckpointRole,
    step: usize,
) -> Result<bool> {
    match load_var_store(vs, dir, role, step) {
        Ok(()) => Ok(true),
        Err(err) => match err.downcast_ref::<CheckpointError>() {
            Some(CheckpointError::Missing { path, .. }) => {
                warn!(
                    "'{}' not found, {} starts from scratch",
                    path.display(),
                    role.name()
                );
                Ok(false)
            }
            None => Err(err),
        },
    }
}

/// Load an optional tensor file. Returns `None` and warns when absent.
pub fn load_tensors_optional(
    dir: impl AsRef<Path>,
    role: CheckpointRole,
    step: usize,
) -> Result<Option<HashMap<String, Tensor>>> {
    let path = checkpoint_path(dir, role, step);
    if !path.is_file() {
        warn!(
            "'{}' not found, {} starts from scratch",
            path.display(),
            role.name()
        );
        return Ok(None);
    }
    let tensors = Tensor::load_multi(&path)
        .with_context(|| format!("unable to load '{}'", path.display()))?;
    Ok(Some(tensors.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trip_test() -> Result<()> {
        let dir = tempfile::tempdir()?;

        let vs = nn::VarStore::new(Device::Cpu);
        let weight = vs.root().randn_standard("weight", &[3, 4]);
        let path = save_var_store(&vs, dir.path(), CheckpointRole::Generator, 8)?;
        assert_eq!(path, dir.path().join("generator_step_8.ot"));
        assert!(!dir.path().join("generator_step_8.ot.tmp").exists());

        let mut restored = nn::VarStore::new(Device::Cpu);
        let restored_weight = restored.root().zeros("weight", &[3, 4]);
        load_var_store(&mut restored, dir.path(), CheckpointRole::Generator, 8)?;
        let diff = f64::from((&weight - &restored_weight).abs().sum(Kind::Float));
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn missing_checkpoint_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut vs = nn::VarStore::new(Device::Cpu);
        let _weight = vs.root().zeros("weight", &[1]);

        let err = load_var_store(&mut vs, dir.path(), CheckpointRole::Discriminator, 3)
            .unwrap_err();
        match err.downcast_ref::<CheckpointError>() {
            Some(CheckpointError::Missing { role, step, path }) => {
                assert_eq!(*role, "discriminator");
                assert_eq!(*step, 3);
                assert_eq!(path, &dir.path().join("discriminator_step_3.ot"));
            }
            _ => panic!("unexpected error {:?}", err),
        }
        assert!(err.to_string().contains("discriminator_step_3.ot"));

        assert!(!load_var_store_optional(
            &mut vs,
            dir.path(),
            CheckpointRole::EmaGenerator,
            3
        )?);
        assert!(load_tensors_optional(dir.path(), CheckpointRole::Optimizers, 3)?.is_none());
        Ok(())
    }

    #[test]
    fn tensors_round_trip_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tensors = vec![("g.step".to_string(), Tensor::of_slice(&[5i64]))];
        save_tensors(&tensors, dir.path(), CheckpointRole::Optimizers, 5)?;
        let loaded = load_tensors_optional(dir.path(), CheckpointRole::Optimizers, 5)?
            .ok_or_else(|| format_err!("missing file"))?;
        assert_eq!(i64::from(loaded["g.step"].get(0)), 5);
        Ok(())
    }
}
