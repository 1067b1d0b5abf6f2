use crate::{common::*, message::LossRecord};
use std::fs::{File, OpenOptions};

/// Receives the losses of every logged step.
pub trait Reporter: Send {
    fn report(&mut self, step: usize, losses: &LossRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&mut self, _step: usize, _losses: &LossRecord) -> Result<()> {
        Ok(())
    }
}

/// Logs every loss at `info` level.
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, step: usize, losses: &LossRecord) -> Result<()> {
        let text = losses
            .iter()
            .map(|(name, entry)| format!("{}={:.5}", name, entry.value))
            .join(" ");
        info!("step: {}\t{}", step, text);
        Ok(())
    }
}

/// Appends `step,name,value,reduction` rows to a CSV file.
#[derive(Debug)]
pub struct CsvReporter {
    writer: csv::Writer<File>,
}

impl CsvReporter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open '{}'", path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        if !exists {
            writer.write_record(&["step", "name", "value", "reduction"])?;
        }
        Ok(Self { writer })
    }
}

impl Reporter for CsvReporter {
    fn report(&mut self, step: usize, losses: &LossRecord) -> Result<()> {
        for (name, entry) in losses.iter() {
            self.writer.write_record(&[
                step.to_string(),
                name.to_owned(),
                entry.value.to_string(),
                entry.reduction.clone(),
            ])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Reporter for Vec<Box<dyn Reporter>> {
    fn report(&mut self, step: usize, losses: &LossRecord) -> Result<()> {
        self.iter_mut()
            .try_for_each(|reporter| reporter.report(step, losses))
    }

    fn flush(&mut self) -> Result<()> {
        self.iter_mut().try_for_each(|reporter| reporter.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_reporter_test() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("losses.csv");

        let mut losses = LossRecord::new();
        losses.insert_mean("g_loss", &Tensor::from(0.25f32), 7);

        {
            let mut reporters: Vec<Box<dyn Reporter>> = vec![
                Box::new(NoopReporter),
                Box::new(TracingReporter),
                Box::new(CsvReporter::new(&path)?),
            ];
            reporters.report(7, &losses)?;
            reporters.flush()?;
        }
        {
            // reopening appends without a second header
            let mut reporter = CsvReporter::new(&path)?;
            reporter.report(8, &losses)?;
            reporter.flush()?;
        }

        let text = fs::read_to_string(&path)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "step,name,value,reduction",
                "7,g_loss,0.25,mean",
                "8,g_loss,0.25,mean"
            ]
        );
        Ok(())
    }
}
