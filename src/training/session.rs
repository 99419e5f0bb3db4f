//! Training session: both networks, their optimizers and the per-batch steps
//!
//! The session owns everything that changes during training. The three
//! per-batch steps (primary update, meta update, evaluation) live here so
//! the epoch loop in `Trainer` only drives batches, progress and output.

use std::path::Path;

use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::info;

use super::checkpoint::load_strict;
use super::losses::{model_entropy, model_fit, FitTarget};
use super::metrics::{accuracy, gradient_cosine};
use super::schedule::StepLr;
use crate::data::{CoarseMapping, ImageBatch, PrimaryLevel, Psi};
use crate::error::Result;
use crate::model::{FunctionalIndexing, LabelGenerator, MultiTaskNetwork};
use crate::utils::Config;

/// Models, optimizers and hyperparameters of one training run
pub struct TrainingSession {
    device: Device,
    psi: Psi,
    mapping: CoarseMapping,
    primary_level: PrimaryLevel,
    net_vs: nn::VarStore,
    net: MultiTaskNetwork,
    gen_vs: nn::VarStore,
    generator: LabelGenerator,
    net_opt: nn::Optimizer,
    gen_opt: nn::Optimizer,
    net_schedule: StepLr,
    gen_schedule: StepLr,
    meta_schedule: StepLr,
    indexing: FunctionalIndexing,
    entropy_weight: f64,
    batch_size: usize,
}

impl TrainingSession {
    /// Build both networks and their optimizers on `device`
    pub fn new(config: &Config, device: Device) -> Result<Self> {
        config.validate()?;
        if let Some(seed) = config.training.seed {
            tch::manual_seed(seed);
        }

        let psi = config.psi()?;
        let training = &config.training;

        let gen_vs = nn::VarStore::new(device);
        let generator = LabelGenerator::new(&gen_vs.root(), psi.clone(), config.model.mask_epsilon);
        let gen_opt = nn::Sgd {
            wd: training.generator_weight_decay,
            ..Default::default()
        }
        .build(&gen_vs, training.generator_learning_rate)?;

        let net_vs = nn::VarStore::new(device);
        let net = MultiTaskNetwork::new(&net_vs.root(), &psi);
        let net_opt = nn::Sgd::default().build(&net_vs, training.learning_rate)?;

        info!(
            "Built networks on {:?}: {} primary classes, {} auxiliary classes, {} + {} tensors",
            device,
            psi.num_primary(),
            psi.total(),
            net_vs.trainable_variables().len(),
            gen_vs.trainable_variables().len()
        );

        Ok(Self {
            device,
            mapping: CoarseMapping::cinic10(),
            primary_level: config.model.primary_level,
            net_vs,
            net,
            gen_vs,
            generator,
            net_opt,
            gen_opt,
            net_schedule: StepLr::new(training.learning_rate, training.lr_step, training.lr_gamma),
            gen_schedule: StepLr::new(training.generator_learning_rate, training.lr_step, training.lr_gamma),
            meta_schedule: StepLr::new(training.meta_learning_rate, training.meta_lr_step, training.meta_lr_gamma),
            indexing: config.model.functional_indexing,
            entropy_weight: training.entropy_weight,
            batch_size: config.data.batch_size,
            psi,
        })
    }

    /// Load a multi-task network checkpoint
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        load_strict(&mut self.net_vs, path)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn psi(&self) -> &Psi {
        &self.psi
    }

    /// Samples per batch the accuracy is divided by
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn network(&self) -> &MultiTaskNetwork {
        &self.net
    }

    pub fn network_store(&self) -> &nn::VarStore {
        &self.net_vs
    }

    pub fn generator(&self) -> &LabelGenerator {
        &self.generator
    }

    pub fn generator_store(&self) -> &nn::VarStore {
        &self.gen_vs
    }

    /// Apply the schedules for `epoch`; returns the meta step size
    pub fn set_epoch(&mut self, epoch: usize) -> f64 {
        let net_lr = self.net_schedule.lr_at(epoch);
        let gen_lr = self.gen_schedule.lr_at(epoch);
        let meta_lr = self.meta_schedule.lr_at(epoch);
        self.net_opt.set_lr(net_lr);
        self.gen_opt.set_lr(gen_lr);
        info!(
            "Epoch {}: lr {:.6}, generator lr {:.6}, meta lr {:.6}",
            epoch, net_lr, gen_lr, meta_lr
        );
        meta_lr
    }

    fn primary_labels(&self, batch: &ImageBatch) -> Result<Tensor> {
        let labels = self.mapping.split(&batch.labels)?;
        Ok(self.primary_level.select(&labels).shallow_clone())
    }

    fn primary_fit(&self, predictions: &Tensor, labels: &Tensor) -> Tensor {
        model_fit(
            predictions,
            FitTarget::Hard {
                labels,
                num_classes: self.psi.num_primary(),
            },
        )
        .mean(Kind::Float)
    }

    /// Update the multi-task network on primary plus generated auxiliary labels.
    ///
    /// Returns primary loss, primary accuracy and the cosine similarity of the
    /// two task gradients on the shared backbone.
    pub fn primary_step(&mut self, batch: &ImageBatch) -> Result<[f64; 3]> {
        let batch = batch.to_device(self.device);
        let primary = self.primary_labels(&batch)?;

        let (pred_primary, pred_auxiliary) = self.net.forward_t(&batch.images, true);
        let auxiliary = tch::no_grad(|| self.generator.generate(&batch.images, &primary, true))?;

        self.net_opt.zero_grad();
        self.gen_opt.zero_grad();

        let primary_loss = self.primary_fit(&pred_primary, &primary);
        let auxiliary_loss = model_fit(&pred_auxiliary, FitTarget::Soft(&auxiliary)).mean(Kind::Float);

        let shared = self.net.shared_weights().tensors();
        let primary_grads = Tensor::f_run_backward(&[&primary_loss], &shared, true, false)?;
        let auxiliary_grads = Tensor::f_run_backward(&[&auxiliary_loss], &shared, true, false)?;
        let cosine = gradient_cosine(&primary_grads, &auxiliary_grads)?;

        let loss_value = f64::try_from(&primary_loss)?;
        (primary_loss + auxiliary_loss).backward();
        self.net_opt.step();

        let acc = accuracy(&pred_primary, &primary, self.batch_size)?;
        Ok([loss_value, acc, cosine])
    }

    /// Update the label generator through one look-ahead SGD step of the
    /// multi-task network.
    ///
    /// Returns primary loss and accuracy before and after the look-ahead step.
    pub fn meta_step(&mut self, batch: &ImageBatch, meta_lr: f64) -> Result<[f64; 4]> {
        let batch = batch.to_device(self.device);
        let primary = self.primary_labels(&batch)?;

        let (pred_primary, pred_auxiliary) = self.net.forward_t(&batch.images, true);
        let auxiliary = self.generator.generate(&batch.images, &primary, true)?;

        self.net_opt.zero_grad();
        self.gen_opt.zero_grad();

        let primary_loss = self.primary_fit(&pred_primary, &primary);
        let auxiliary_loss = model_fit(&pred_auxiliary, FitTarget::Soft(&auxiliary)).mean(Kind::Float);
        let entropy = model_entropy(&auxiliary);

        let pre_loss = f64::try_from(&primary_loss)?;
        let pre_acc = accuracy(&pred_primary, &primary, self.batch_size)?;

        let weights = self.net.weights();
        let params = weights.tensors();
        let grads = Tensor::f_run_backward(&[&(primary_loss + auxiliary_loss)], &params, true, true)?;
        let fast_weights = weights.sgd_step(&grads, meta_lr)?;

        let (post_primary, _) = self.net.forward_with(&batch.images, &fast_weights, self.indexing)?;
        let post_loss = self.primary_fit(&post_primary, &primary);
        let post_value = f64::try_from(&post_loss)?;

        (post_loss + entropy * self.entropy_weight).backward();
        self.gen_opt.step();

        let post_acc = accuracy(&post_primary, &primary, self.batch_size)?;
        Ok([pre_loss, pre_acc, post_value, post_acc])
    }

    /// Primary loss and accuracy on a held-out batch, eval-mode batch norm
    pub fn eval_step(&self, batch: &ImageBatch) -> Result<[f64; 2]> {
        tch::no_grad(|| -> Result<[f64; 2]> {
            let batch = batch.to_device(self.device);
            let primary = self.primary_labels(&batch)?;
            let (pred_primary, _) = self.net.forward_t(&batch.images, false);
            let loss = self.primary_fit(&pred_primary, &primary);
            Ok([
                f64::try_from(&loss)?,
                accuracy(&pred_primary, &primary, self.batch_size)?,
            ])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchSource, SyntheticImages};

    fn session() -> (TrainingSession, ImageBatch) {
        session_with(|_| {})
    }

    fn session_with(configure: impl FnOnce(&mut Config)) -> (TrainingSession, ImageBatch) {
        let mut config = Config::default();
        config.data.batch_size = 4;
        config.training.seed = Some(5);
        configure(&mut config);
        let session = TrainingSession::new(&config, Device::Cpu).unwrap();

        let mut source = SyntheticImages::new(4, 10, 8, 4, Device::Cpu).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        (session, batch)
    }

    fn snapshot(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
        let mut variables: Vec<(String, Tensor)> =
            vs.variables().into_iter().map(|(name, t)| (name, t.copy())).collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        variables
    }

    fn is_parameter(name: &str) -> bool {
        name.ends_with("weight") || name.ends_with("bias")
    }

    /// Names whose values differ between `before` and the current store
    fn changed(before: &[(String, Tensor)], vs: &nn::VarStore) -> Vec<String> {
        before
            .iter()
            .zip(snapshot(vs))
            .filter(|((_, a), (_, b))| (a - b).abs().max().double_value(&[]) > 0.0)
            .map(|((name, _), _)| name.clone())
            .collect()
    }

    #[test]
    fn test_meta_step_trains_generator() {
        let (mut session, batch) = session();
        let net_before = snapshot(session.network_store());
        let gen_before = snapshot(session.generator_store());

        let [pre_loss, pre_acc, post_loss, post_acc] = session.meta_step(&batch, 0.01).unwrap();
        assert!(pre_loss > 0.0 && post_loss > 0.0);
        assert!((0.0..=1.0).contains(&pre_acc));
        assert!((0.0..=1.0).contains(&post_acc));

        let grads_nonzero = session
            .generator_store()
            .trainable_variables()
            .iter()
            .filter(|v| v.grad().defined() && v.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0)
            .count();
        assert!(grads_nonzero > 0);

        let gen_changed = changed(&gen_before, session.generator_store());
        assert!(gen_changed.iter().any(|name| is_parameter(name)));

        // The look-ahead step never touches the real network parameters
        let net_changed = changed(&net_before, session.network_store());
        assert!(net_changed.iter().all(|name| !is_parameter(name)), "{:?}", net_changed);
    }

    #[test]
    fn test_look_ahead_loss_alone_reaches_generator() {
        // Without the entropy term the generator only sees the primary loss
        // of the adapted weights, through the gradient of the inner step.
        let (mut session, batch) = session_with(|config| config.training.entropy_weight = 0.0);
        session.meta_step(&batch, 0.1).unwrap();

        let with_grad: Vec<f64> = session
            .generator_store()
            .trainable_variables()
            .iter()
            .map(|v| v.grad())
            .filter(|g| g.defined())
            .map(|g| g.abs().sum(Kind::Float).double_value(&[]))
            .collect();
        assert!(!with_grad.is_empty());
        assert!(with_grad.iter().all(|g| g.is_finite()));
        assert!(with_grad.iter().any(|g| *g > 0.0), "{:?}", with_grad);
    }

    #[test]
    fn test_first_order_step_cuts_generator_off() {
        // Same objective with the inner gradients detached: the adapted
        // weights no longer depend on the generated labels.
        let (session, batch) = session_with(|config| config.training.entropy_weight = 0.0);
        let primary = session.primary_labels(&batch).unwrap();
        let (pred_primary, pred_auxiliary) = session.net.forward_t(&batch.images, true);
        let auxiliary = session.generator.generate(&batch.images, &primary, true).unwrap();
        let loss = session.primary_fit(&pred_primary, &primary)
            + model_fit(&pred_auxiliary, FitTarget::Soft(&auxiliary)).mean(Kind::Float);

        let weights = session.net.weights();
        let grads = Tensor::run_backward(&[&loss], &weights.tensors(), true, false);
        let fast_weights = weights.sgd_step(&grads, 0.1).unwrap();
        let (post, _) = session
            .net
            .forward_with(&batch.images, &fast_weights, session.indexing)
            .unwrap();
        let post_loss = session.primary_fit(&post, &primary);

        // Autograd either finds no path or yields only zero gradients
        let generator_params = session.generator_store().trainable_variables();
        match Tensor::f_run_backward(&[&post_loss], &generator_params, false, false) {
            Err(_) => {}
            Ok(grads) => assert!(grads
                .iter()
                .all(|g| !g.defined() || g.abs().sum(Kind::Float).double_value(&[]) == 0.0)),
        }
    }

    #[test]
    fn test_primary_step_leaves_generator_parameters() {
        let (mut session, batch) = session();
        let gen_before = snapshot(session.generator_store());
        let net_before = snapshot(session.network_store());

        let [loss, acc, cosine] = session.primary_step(&batch).unwrap();
        assert!(loss > 0.0);
        assert!((0.0..=1.0).contains(&acc));
        assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(&cosine));

        let net_changed = changed(&net_before, session.network_store());
        assert!(net_changed.iter().any(|name| is_parameter(name)));

        let gen_changed = changed(&gen_before, session.generator_store());
        assert!(gen_changed.iter().all(|name| !is_parameter(name)), "{:?}", gen_changed);
    }

    #[test]
    fn test_eval_step_changes_nothing() {
        let (session, batch) = session();
        let before = snapshot(session.network_store());

        let [loss, acc] = session.eval_step(&batch).unwrap();
        assert!(loss >= 0.0);
        assert!((0.0..=1.0).contains(&acc));
        assert!(changed(&before, session.network_store()).is_empty());
    }

    #[test]
    fn test_schedules_follow_epoch() {
        let (mut session, _) = session();
        assert_eq!(session.set_epoch(0), 0.01);
        assert_eq!(session.set_epoch(20), 0.0025);
    }
}
