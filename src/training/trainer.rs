//! Meta-training loop
//!
//! Each epoch runs three passes: a primary update of the multi-task network
//! over the whole training source, a meta update of the label generator over
//! the same source, and an evaluation pass over the test source. The epoch
//! ends with a checkpoint and one line in the training log.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use super::checkpoint::CheckpointWriter;
use super::metrics::{EpochCost, META_SLOTS, PRIMARY_SLOTS, TEST_SLOTS};
use super::session::TrainingSession;
use crate::data::BatchSource;
use crate::error::{Error, Result};
use crate::utils::{EpochLog, TrainingConfig};

fn progress_bar(len: usize, label: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{prefix:>6} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_prefix(label);
    pb
}

/// Drives a `TrainingSession` through its epochs
pub struct Trainer {
    session: TrainingSession,
    checkpoints: CheckpointWriter,
    log: EpochLog,
    start_epoch: usize,
    total_epochs: usize,
    /// Primary updates performed by this trainer so far
    iteration: usize,
}

impl Trainer {
    /// Create a trainer writing checkpoints into `outf`
    pub fn new<P: AsRef<Path>>(session: TrainingSession, config: &TrainingConfig, outf: P) -> Result<Self> {
        let log = EpochLog::open(&config.log_file)?;
        info!("Appending epoch summaries to {}", log.path().display());

        Ok(Self {
            session,
            checkpoints: CheckpointWriter::new(outf),
            log,
            start_epoch: config.start_epoch,
            total_epochs: config.total_epochs,
            iteration: 0,
        })
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    /// Primary updates performed so far
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Run epochs `start_epoch..total_epochs`; returns the cost of each epoch
    pub fn train(
        &mut self,
        train: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
    ) -> Result<Vec<EpochCost>> {
        if train.num_batches() == 0 || test.num_batches() == 0 {
            return Err(Error::data_source("training and test sources must not be empty"));
        }
        let expected = self.session.batch_size();
        for (split, source) in [("training", &*train), ("test", &*test)] {
            if source.batch_size() != expected {
                return Err(Error::data_source(format!(
                    "{} source yields batches of {}, accuracy is computed over {}",
                    split,
                    source.batch_size(),
                    expected
                )));
            }
        }

        info!(
            "Training epochs {}..{} ({} train batches, {} test batches)",
            self.start_epoch,
            self.total_epochs,
            train.num_batches(),
            test.num_batches()
        );

        let mut history = Vec::with_capacity(self.total_epochs.saturating_sub(self.start_epoch));
        for epoch in self.start_epoch..self.total_epochs {
            let cost = self.run_epoch(epoch, train, test)?;

            self.checkpoints.save(self.session.network_store(), epoch)?;
            self.log.write_line(&cost.log_line(epoch, self.iteration))?;
            history.push(cost);
        }

        info!("Training complete after {} primary updates", self.iteration);
        Ok(history)
    }

    /// One epoch: primary pass, meta pass, evaluation pass
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        train: &mut dyn BatchSource,
        test: &mut dyn BatchSource,
    ) -> Result<EpochCost> {
        let meta_lr = self.session.set_epoch(epoch);
        let mut cost = EpochCost::new();

        self.primary_pass(train, &mut cost)?;
        self.meta_pass(train, meta_lr, &mut cost)?;
        self.evaluate(test, &mut cost)?;

        debug!("Epoch {} finished: {}", epoch, cost);
        Ok(cost)
    }

    fn primary_pass(&mut self, train: &mut dyn BatchSource, cost: &mut EpochCost) -> Result<()> {
        let num_batches = train.num_batches();
        let pb = progress_bar(num_batches, "train");
        train.reset();

        while let Some(batch) = train.next_batch() {
            let values = self.session.primary_step(&batch?)?;
            cost.add(PRIMARY_SLOTS, &values, num_batches);
            self.iteration += 1;
            pb.set_message(format!("loss {:.4}", values[0]));
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(())
    }

    fn meta_pass(&mut self, train: &mut dyn BatchSource, meta_lr: f64, cost: &mut EpochCost) -> Result<()> {
        let num_batches = train.num_batches();
        let pb = progress_bar(num_batches, "meta");
        train.reset();

        while let Some(batch) = train.next_batch() {
            let values = self.session.meta_step(&batch?, meta_lr)?;
            cost.add(META_SLOTS, &values, num_batches);
            pb.set_message(format!("after {:.4}", values[2]));
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(())
    }

    fn evaluate(&mut self, test: &mut dyn BatchSource, cost: &mut EpochCost) -> Result<()> {
        let num_batches = test.num_batches();
        let pb = progress_bar(num_batches, "test");
        test.reset();

        while let Some(batch) = test.next_batch() {
            let values = self.session.eval_step(&batch?)?;
            cost.add(TEST_SLOTS, &values, num_batches);
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(())
    }
}
