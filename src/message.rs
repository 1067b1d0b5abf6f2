use crate::common::*;

/// One named scalar produced by an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossEntry {
    pub value: f64,
    /// How the value was aggregated over the batch, e.g. `mean`.
    pub reduction: String,
    pub step: usize,
}

/// Named losses of one discriminator or generator update, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossRecord(pub IndexMap<String, LossEntry>);

impl LossRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the scalar out of a 0-d tensor and store it with `mean` reduction.
    pub fn insert_mean(&mut self, name: &str, loss: &Tensor, step: usize) {
        let value = f64::from(loss.detach());
        self.0.insert(
            name.to_owned(),
            LossEntry {
                value,
                reduction: "mean".into(),
                step,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).map(|entry| entry.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|key| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LossEntry)> {
        self.0.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append the entries of `other`, overwriting equal names.
    pub fn extend(&mut self, other: LossRecord) {
        self.0.extend(other.0);
    }
}

/// A batch of one-hot facies maps `[B, n_classes, R, R]` with optional
/// pixel-map conditioning of the same shape.
#[derive(Debug)]
pub struct Batch {
    pub data: Tensor,
    pub pixel_maps: Option<Tensor>,
    pub batch_index: usize,
}

impl Batch {
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            data: self.data.to_device(device),
            pixel_maps: self
                .pixel_maps
                .as_ref()
                .map(|maps| maps.to_device(device)),
            batch_index: self.batch_index,
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.data.size()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_record_test() {
        let mut record = LossRecord::new();
        record.insert_mean("d_loss", &Tensor::from(1.5f32), 3);
        record.insert_mean("d_loss_real", &Tensor::from(-0.5f32), 3);

        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["d_loss", "d_loss_real"]);
        assert_eq!(record.get("d_loss"), Some(1.5));
        assert_eq!(record.0["d_loss_real"].reduction, "mean");
        assert_eq!(record.0["d_loss_real"].step, 3);
        assert!(record.get("g_loss").is_none());
    }
}
