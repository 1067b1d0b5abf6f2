use crate::{
    checkpoint::{self, CheckpointRole},
    coloring,
    common::*,
    conditioning::{colorize_pixel_maps, generate_pixel_maps, pixel_maps_from_data},
    config::{AdvLoss, Architecture, Config},
    dataset::DataLoader,
    ema::Ema,
    logging::Reporter,
    message::{Batch, LossRecord},
    model::{
        init_weights, loss, Discriminator, DiscriminatorInit, Generator, GeneratorInit, WGanGp,
        WGanGpInit,
    },
    optim::{Adam, AdamInit, GradScaler, GradScalerInit},
    utils::{on_cadence, RateCounter},
};
use ndarray::Array4;

const ADAM_EPS: f64 = 1e-8;

/// Colorized samples of one generator forward pass.
#[derive(Debug)]
pub struct GeneratedData {
    /// `[B, R, R, 3]` RGB images.
    pub images: Array4<u8>,
    /// One `[B, H*W, H*W]` map per attention layer, in block order.
    pub attentions: Vec<Tensor>,
}

/// Sample from `generator` without gradient tracking and colorize the
/// per-pixel argmax class.
pub fn generate_data(
    generator: &mut Generator,
    batch_size: i64,
    pixel_maps: Option<&Tensor>,
    device: Device,
) -> Result<GeneratedData> {
    tch::no_grad(|| {
        let z = Tensor::randn(&[batch_size, generator.z_dim()], (Kind::Float, device));
        let (probs, attentions) = generator.forward_t(&z, pixel_maps, false)?;
        let (_, n_classes, _, _) = probs.size4()?;
        let classes = probs.argmax(1, false).to_device(Device::Cpu);
        let images = coloring::color_data(&classes, n_classes as usize)?;
        Ok(GeneratedData { images, attentions })
    })
}

#[derive(Debug, Clone)]
pub struct TrainerInit<'a> {
    pub config: &'a Config,
    pub n_classes: usize,
}

impl<'a> TrainerInit<'a> {
    /// Build networks and optimizers, restoring `recover_model_step` when set.
    pub fn build(self) -> Result<Trainer> {
        let Self { config, n_classes } = self;
        let architecture = config.model.architecture()?;
        let init_method = config.model.init_method()?;
        let device = config.training.device;
        let cond_channels = architecture.is_conditional().then(|| n_classes);

        // generator and its moving average
        let (generator_vs, generator) = {
            let vs = nn::VarStore::new(device);
            let generator = GeneratorInit {
                model: config.model.clone(),
                n_classes,
                cond_channels,
            }
            .build(&vs.root() / "generator")?;
            init_weights(&vs, init_method)?;
            (vs, generator)
        };
        let (ema_vs, ema_generator) = {
            let mut vs = nn::VarStore::new(device);
            let generator = GeneratorInit {
                model: config.model.clone(),
                n_classes,
                cond_channels,
            }
            .build(&vs.root() / "generator")?;
            vs.freeze();
            (vs, generator)
        };
        let ema = Ema::new(
            &ema_vs,
            &generator_vs,
            config.training.ema_decay.raw(),
            config.training.ema_start_step,
        )?;

        let (discriminator_vs, discriminator) = {
            let vs = nn::VarStore::new(device);
            let discriminator = DiscriminatorInit {
                model: config.model.clone(),
                n_classes,
                cond_channels,
            }
            .build(&vs.root() / "discriminator")?;
            init_weights(&vs, init_method)?;
            (vs, discriminator)
        };

        let g_opt = AdamInit {
            lr: config.training.g_lr.raw(),
            beta1: config.training.beta1.raw(),
            beta2: config.training.beta2.raw(),
            eps: ADAM_EPS,
        }
        .build(&generator_vs)?;
        let d_opt = AdamInit {
            lr: config.training.d_lr.raw(),
            beta1: config.training.beta1.raw(),
            beta2: config.training.beta2.raw(),
            eps: ADAM_EPS,
        }
        .build(&discriminator_vs)?;
        let g_scaler = GradScalerInit::new(config.training.mixed_precision).build()?;
        let d_scaler = GradScalerInit::new(config.training.mixed_precision).build()?;

        let gp = WGanGpInit {
            lambda: config.training.lambda_gp.raw(),
            ..Default::default()
        }
        .build()?;

        let mut trainer = Trainer {
            config: config.clone(),
            architecture,
            n_classes,
            device,
            generator_vs,
            generator,
            ema_vs,
            ema_generator,
            ema,
            discriminator_vs,
            discriminator,
            g_opt,
            d_opt,
            g_scaler,
            d_scaler,
            gp,
            rng: StdRng::seed_from_u64(config.seed),
            step: 1,
        };

        if let Some(step) = config.recover_model_step {
            trainer.recover(step)?;
        }

        Ok(trainer)
    }
}

#[derive(Debug)]
pub struct Trainer {
    config: Config,
    architecture: Architecture,
    n_classes: usize,
    device: Device,
    generator_vs: nn::VarStore,
    generator: Generator,
    ema_vs: nn::VarStore,
    ema_generator: Generator,
    ema: Ema,
    discriminator_vs: nn::VarStore,
    discriminator: Discriminator,
    g_opt: Adam,
    d_opt: Adam,
    g_scaler: GradScaler,
    d_scaler: GradScaler,
    gp: WGanGp,
    rng: StdRng,
    /// The next step to run, starting from 1.
    step: usize,
}

impl Trainer {
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn generator_vs(&self) -> &nn::VarStore {
        &self.generator_vs
    }

    pub fn discriminator_vs(&self) -> &nn::VarStore {
        &self.discriminator_vs
    }

    pub fn ema_vs(&self) -> &nn::VarStore {
        &self.ema_vs
    }

    fn recover(&mut self, step: usize) -> Result<()> {
        let Self {
            ref config,
            ref mut generator_vs,
            ref mut discriminator_vs,
            ref mut ema_vs,
            ref mut ema,
            ref mut g_opt,
            ref mut d_opt,
            ref mut g_scaler,
            ref mut d_scaler,
            ..
        } = *self;
        let dir = config.checkpoint_dir();

        checkpoint::load_var_store(generator_vs, &dir, CheckpointRole::Generator, step)?;
        checkpoint::load_var_store(discriminator_vs, &dir, CheckpointRole::Discriminator, step)?;

        if checkpoint::load_var_store_optional(ema_vs, &dir, CheckpointRole::EmaGenerator, step)? {
            ema.set_initialized();
        }
        if let Some(state) = checkpoint::load_tensors_optional(&dir, CheckpointRole::Optimizers, step)? {
            g_opt.load_state_tensors("g", &state)?;
            d_opt.load_state_tensors("d", &state)?;
            g_scaler.load_state_tensors("g_scaler", &state)?;
            d_scaler.load_state_tensors("d_scaler", &state)?;
        }

        info!("recovered from step {}", step);
        self.step = step + 1;
        Ok(())
    }

    /// Pixel maps for a real batch on the training device, carried by the
    /// batch or sampled from its data.
    fn real_pixel_maps(&mut self, batch: &Batch) -> Result<Option<Tensor>> {
        if !self.architecture.is_conditional() {
            return Ok(None);
        }
        let maps = match &batch.pixel_maps {
            Some(maps) => maps.shallow_clone(),
            None => pixel_maps_from_data(&mut self.rng, &batch.data, &self.config.data.n_pixels)?,
        };
        Ok(Some(maps.to_device(self.device)))
    }

    fn random_pixel_maps(&mut self, batch_size: i64) -> Result<Option<Tensor>> {
        if !self.architecture.is_conditional() {
            return Ok(None);
        }
        let maps = generate_pixel_maps(
            &mut self.rng,
            batch_size as usize,
            self.n_classes,
            &self.config.data.n_pixels,
            self.config.model.data_size,
            self.device,
        )?;
        Ok(Some(maps))
    }

    /// One discriminator update on `batch` against a fresh fake batch.
    ///
    /// Returns `d_loss`, `d_loss_real` and, with the Wasserstein loss only,
    /// `d_loss_gp`.
    pub fn train_discriminator(&mut self, batch: &Batch) -> Result<LossRecord> {
        let real = batch.data.to_device(self.device);
        let batch_size = real.size()[0];
        let real_maps = self.real_pixel_maps(batch)?;
        let fake_maps = self.random_pixel_maps(batch_size)?;

        let Self {
            ref config,
            device,
            step,
            ref mut generator,
            ref mut discriminator,
            ref mut discriminator_vs,
            ref mut d_opt,
            ref mut d_scaler,
            ref gp,
            ..
        } = *self;
        let adv_loss = config.training.adv_loss;

        discriminator_vs.unfreeze();

        let z = Tensor::randn(&[batch_size, generator.z_dim()], (Kind::Float, device));
        let fake = tch::no_grad(|| generator.forward_t(&z, fake_maps.as_ref(), true))?
            .0
            .detach();

        let (real_scores, _) = discriminator.forward(&real, real_maps.as_ref())?;
        let (fake_scores, _) = discriminator.forward(&fake, fake_maps.as_ref())?;
        let d_loss_real = loss::d_loss_real(adv_loss, &real_scores);
        let d_loss_fake = loss::d_loss_fake(adv_loss, &fake_scores);

        // the gradient penalty only applies to the Wasserstein loss
        let d_loss_gp = match adv_loss {
            AdvLoss::WGanGp => {
                let gp_maps = real_maps.as_ref();
                let penalty = gp.forward(&real, &fake, |xs| {
                    discriminator.forward(xs, gp_maps).map(|(scores, _)| scores)
                })?;
                Some(penalty)
            }
            AdvLoss::Hinge => None,
        };

        let d_loss = match &d_loss_gp {
            Some(penalty) => &d_loss_real + &d_loss_fake + penalty,
            None => &d_loss_real + &d_loss_fake,
        };

        d_opt.zero_grad();
        d_scaler.scale_loss(&d_loss).backward();
        d_scaler.step(d_opt);

        let mut losses = LossRecord::new();
        losses.insert_mean("d_loss", &d_loss, step);
        losses.insert_mean("d_loss_real", &d_loss_real, step);
        if let Some(penalty) = &d_loss_gp {
            losses.insert_mean("d_loss_gp", penalty, step);
        }
        Ok(losses)
    }

    /// One generator update with the discriminator held fixed, followed by
    /// the EMA update. Returns `g_loss` only.
    pub fn train_generator(&mut self, batch: &Batch) -> Result<LossRecord> {
        let batch_size = batch.batch_size();
        let pixel_maps = self.real_pixel_maps(batch)?;

        let Self {
            ref config,
            device,
            step,
            ref mut generator,
            ref mut discriminator,
            ref mut discriminator_vs,
            ref mut g_opt,
            ref mut g_scaler,
            ref mut ema,
            ..
        } = *self;

        discriminator_vs.freeze();
        let g_loss = (|| -> Result<_> {
            let z = Tensor::randn(&[batch_size, generator.z_dim()], (Kind::Float, device));
            let (fake, _) = generator.forward_t(&z, pixel_maps.as_ref(), true)?;
            let (fake_scores, _) = discriminator.forward(&fake, pixel_maps.as_ref())?;
            let g_loss = loss::g_loss_fake(&fake_scores);

            // observed pixels of the conditioning must be reproduced
            let g_loss = match &pixel_maps {
                Some(maps) => {
                    let penalty = loss::cond_penalty(&fake, maps)?;
                    g_loss + penalty * config.training.cond_penalty.raw()
                }
                None => g_loss,
            };
            Ok(g_loss)
        })();
        discriminator_vs.unfreeze();
        let g_loss = g_loss?;

        g_opt.zero_grad();
        g_scaler.scale_loss(&g_loss).backward();
        g_scaler.step(g_opt);
        ema.update(step);

        let mut losses = LossRecord::new();
        losses.insert_mean("g_loss", &g_loss, step);
        Ok(losses)
    }

    /// Generate a batch of `training.batch_size` samples from the current or
    /// the EMA generator. Falls back to the current weights until the EMA is
    /// initialized.
    pub fn generate_data(&mut self, use_ema: bool) -> Result<(GeneratedData, Option<Tensor>)> {
        let batch_size = self.config.training.batch_size.get() as i64;
        let pixel_maps = self.random_pixel_maps(batch_size)?;

        let generator = if use_ema && self.ema.is_initialized() {
            &mut self.ema_generator
        } else {
            &mut self.generator
        };
        let data = generate_data(generator, batch_size, pixel_maps.as_ref(), self.device)?;
        Ok((data, pixel_maps))
    }

    /// Write generator, discriminator, EMA generator and optimizer state of `step`.
    pub fn save_checkpoint(&self, step: usize) -> Result<()> {
        let Self {
            ref config,
            ref generator_vs,
            ref discriminator_vs,
            ref ema_vs,
            ref ema,
            ref g_opt,
            ref d_opt,
            ref g_scaler,
            ref d_scaler,
            ..
        } = *self;
        let dir = config.checkpoint_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create '{}'", dir.display()))?;

        checkpoint::save_var_store(generator_vs, &dir, CheckpointRole::Generator, step)?;
        checkpoint::save_var_store(discriminator_vs, &dir, CheckpointRole::Discriminator, step)?;
        if ema.is_initialized() {
            checkpoint::save_var_store(ema_vs, &dir, CheckpointRole::EmaGenerator, step)?;
        }

        let state: Vec<_> = g_opt
            .state_tensors("g")
            .into_iter()
            .chain(d_opt.state_tensors("d"))
            .chain(g_scaler.state_tensors("g_scaler"))
            .chain(d_scaler.state_tensors("d_scaler"))
            .collect();
        checkpoint::save_tensors(&state, &dir, CheckpointRole::Optimizers, step)?;

        info!("saved checkpoint of step {} to '{}'", step, dir.display());
        Ok(())
    }

    fn save_samples(&mut self, step: usize) -> Result<()> {
        let dir = self.config.sample_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("unable to create '{}'", dir.display()))?;

        let use_ema = self.config.save.sample_with_ema;
        let (data, pixel_maps) = self.generate_data(use_ema)?;
        coloring::save_image_grid(&data.images, dir.join(format!("step_{}.png", step)))?;

        if let Some(pixel_maps) = pixel_maps {
            let colored = colorize_pixel_maps(&pixel_maps)?;
            coloring::save_image_grid(&colored, dir.join(format!("step_{}_pixel_maps.png", step)))?;
        }
        Ok(())
    }

    /// Run from the current step through `training.total_step`.
    pub fn train(
        &mut self,
        loader: &mut dyn DataLoader,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        ensure!(
            loader.n_classes() == self.n_classes,
            "the data loader yields {} classes, but the model expects {}",
            loader.n_classes(),
            self.n_classes
        );

        let total_step = self.config.training.total_step;
        let d_iters = self.config.training.d_iters.get();
        let mut rate_counter = RateCounter::with_second_interval();

        while self.step <= total_step {
            let step = self.step;
            let batch = loader.next_batch()?.to_device(self.device);

            let mut losses = LossRecord::new();
            for _ in 0..d_iters {
                losses.extend(self.train_discriminator(&batch)?);
            }
            losses.extend(self.train_generator(&batch)?);
            rate_counter.add(1.0);

            if on_cadence(step, self.config.logging.log_step) {
                reporter.report(step, &losses)?;
                if let Some(rate) = rate_counter.rate() {
                    info!("step: {}\t{:.2} step/s", step, rate);
                }
            }
            if on_cadence(step, self.config.save.sample_step) {
                self.save_samples(step)?;
            }
            if on_cadence(step, self.config.save.model_step) {
                self.save_checkpoint(step)?;
                reporter.flush()?;
            }

            self.step += 1;
        }

        reporter.flush()?;
        info!("training finished at step {}", total_step);
        Ok(())
    }
}
