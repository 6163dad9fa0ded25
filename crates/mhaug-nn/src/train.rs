//! Multi-view training driver.
//!
//! One worker thread per partition. Every epoch a worker:
//!
//! 1. lines up with its peers ([`Membership::barrier`]);
//! 2. runs the augmentation controller once, which commits new prev/cur
//!    masks for its partition and picks the consistency mode;
//! 3. drains an aligned epoch and, per step, forwards org/prev/cur, builds
//!    the composite loss, averages gradients across the workers that still
//!    have batches and applies an AdamW update;
//! 4. once out of batches, shadows its peers' remaining rounds
//!    ([`Membership::join`]) and applies the same averaged updates;
//! 5. every `eval_every` epochs, evaluates.
//!
//! All workers start from the same parameters and apply the same sequence of
//! averaged gradients, so parameters and optimizer state stay identical even
//! when partitions yield different step counts. [`Trainer::fit`] checks this
//! before reporting.

use crate::augment::{AugmentationController, Decision};
use crate::collective::{LocalGroup, Membership};
use crate::config::TrainConfig;
use crate::loss::{assemble, LossWeights};
use crate::model::{accuracy, correct, seed_labels, view_inputs, DistSage, NodeClassifier};
use crate::{Error, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use mhaug_core::{
    node_split, pad_to, AlignedEpoch, GraphViewStore, MaskKind, MultiViewLoader, NeighborSampler,
    NodeId, SplitMasks, View, ViewWeights,
};
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Per-worker, per-epoch statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochStats {
    pub rank: usize,
    pub epoch: usize,
    pub steps: usize,
    /// Mean total loss over the epoch's steps.
    pub loss: f64,
    /// Mean org-view accuracy over the epoch's steps.
    pub train_acc: f64,
    pub epoch_time: f64,
    pub sample_time: f64,
    pub forward_time: f64,
    pub backward_time: f64,
    pub update_time: f64,
    pub num_seeds: usize,
    pub num_inputs: usize,
    pub teacher: View,
    pub mask_version: u64,
    pub attempts: usize,
}

/// Correct/total counts on one worker's validation and test seeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvalCounts {
    pub val_correct: usize,
    pub val_total: usize,
    pub test_correct: usize,
    pub test_total: usize,
}

impl EvalCounts {
    pub fn merge(self, other: Self) -> Self {
        Self {
            val_correct: self.val_correct + other.val_correct,
            val_total: self.val_total + other.val_total,
            test_correct: self.test_correct + other.test_correct,
            test_total: self.test_total + other.test_total,
        }
    }

    pub fn val_acc(&self) -> f64 {
        ratio(self.val_correct, self.val_total)
    }

    pub fn test_acc(&self) -> f64 {
        ratio(self.test_correct, self.test_total)
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Outcome of a full run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSummary {
    pub n_classes: usize,
    /// Mean epoch time of rank 0 over the last 80% of epochs.
    pub mean_epoch_time: f64,
    pub val_acc: f64,
    pub test_acc: f64,
    /// Accepted augmentations that were committed, summed over workers.
    pub commits: usize,
    pub epochs: Vec<EpochStats>,
}

/// Final parameters of one worker, sorted by name.
pub type Replica = Vec<(String, Vec<f32>)>;

/// Summary plus the parameters every worker ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub summary: TrainSummary,
    /// One entry per rank.
    pub replicas: Vec<Replica>,
}

/// Per-rank seed lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSeeds {
    pub train: Vec<NodeId>,
    pub val: Vec<NodeId>,
    pub test: Vec<NodeId>,
}

/// Split train/val/test seeds over `num_parts` workers.
///
/// Splits are balanced (`force_even`); with `pad_data` every train list is
/// padded to the longest one so all workers run the same number of steps.
pub fn split_seeds(
    store: &GraphViewStore,
    splits: &SplitMasks,
    pad_data: bool,
) -> Result<Vec<WorkerSeeds>> {
    let book = store.partition_book();
    let mut seeds = (0..book.num_parts())
        .map(|rank| {
            Ok(WorkerSeeds {
                train: node_split(&splits.train, book, rank, true)?,
                val: node_split(&splits.val, book, rank, true)?,
                test: node_split(&splits.test, book, rank, true)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if pad_data {
        let longest = seeds.iter().map(|s| s.train.len()).max().unwrap_or(0);
        for worker in &mut seeds {
            pad_to(&mut worker.train, longest);
        }
    }

    for (rank, worker) in seeds.iter().enumerate() {
        let local = |nodes: &[NodeId]| nodes.iter().filter(|&&n| book.is_local(rank, n)).count();
        tracing::info!(
            part = rank,
            train = worker.train.len(),
            train_local = local(&worker.train),
            val = worker.val.len(),
            val_local = local(&worker.val),
            test = worker.test.len(),
            test_local = local(&worker.test),
            "seed split"
        );
    }
    Ok(seeds)
}

struct WorkerReport {
    epochs: Vec<EpochStats>,
    eval: EvalCounts,
    commits: usize,
    replica: Replica,
}

/// Trains a [`DistSage`] with Metropolis-Hastings augmentation.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainConfig,
    device: Device,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: Device::Cpu,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Train one worker per partition of `store` and report the final accuracy.
    ///
    /// Fails if the worker replicas ended with different parameters.
    pub fn fit(&self, store: Arc<GraphViewStore>, splits: &SplitMasks) -> Result<TrainSummary> {
        let output = self.train(store, splits)?;
        if let Some(rank) = diverged_replica(&output.replicas) {
            return Err(Error::Training(format!(
                "worker {rank} ended with parameters different from worker 0"
            )));
        }
        Ok(output.summary)
    }

    /// Like [`Trainer::fit`], but also returns every worker's final parameters.
    pub fn train(&self, store: Arc<GraphViewStore>, splits: &SplitMasks) -> Result<TrainOutput> {
        let num_parts = store.partition_book().num_parts();
        if num_parts != self.config.num_parts {
            return Err(Error::InvalidConfig(format!(
                "store has {num_parts} partitions, config expects {}",
                self.config.num_parts
            )));
        }
        let n_classes = match self.config.n_classes {
            0 => store.num_classes(),
            n => n,
        };
        if n_classes == 0 {
            return Err(Error::InvalidConfig("no classes to predict".into()));
        }
        tracing::info!(n_classes, num_parts, "starting training");

        let seeds = split_seeds(&store, splits, self.config.pad_data)?;
        let init = self.initial_parameters(store.feature_dim(), n_classes)?;
        let group = LocalGroup::new(num_parts);

        let results: Vec<Result<WorkerReport>> = thread::scope(|scope| {
            let handles: Vec<_> = seeds
                .into_iter()
                .enumerate()
                .map(|(rank, worker_seeds)| {
                    let member = group.member(rank);
                    let store = Arc::clone(&store);
                    let init = &init;
                    scope.spawn(move || {
                        self.run_worker(member, store, worker_seeds, init, n_classes)
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Training(format!("worker {rank} panicked"))))
                })
                .collect()
        });

        let mut epochs = Vec::new();
        let mut eval = EvalCounts::default();
        let mut commits = 0;
        let mut replicas = Vec::with_capacity(num_parts);
        for result in results {
            let report = result?;
            epochs.extend(report.epochs);
            eval = eval.merge(report.eval);
            commits += report.commits;
            replicas.push(report.replica);
        }

        let summary = TrainSummary {
            n_classes,
            mean_epoch_time: mean_epoch_time(&epochs, self.config.num_epochs),
            val_acc: eval.val_acc(),
            test_acc: eval.test_acc(),
            commits,
            epochs,
        };
        tracing::info!(
            mean_epoch_time = summary.mean_epoch_time,
            val_acc = summary.val_acc,
            test_acc = summary.test_acc,
            commits,
            "training finished"
        );
        Ok(TrainOutput { summary, replicas })
    }

    fn build_model(
        &self,
        in_features: usize,
        n_classes: usize,
        varmap: &VarMap,
    ) -> Result<DistSage> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &self.device);
        DistSage::new(
            in_features,
            self.config.num_hidden,
            n_classes,
            self.config.num_layers,
            self.config.dropout,
            vb,
        )
    }

    /// One random initialization shared by all workers, sorted by name.
    fn initial_parameters(
        &self,
        in_features: usize,
        n_classes: usize,
    ) -> Result<Vec<(String, Tensor)>> {
        let varmap = VarMap::new();
        self.build_model(in_features, n_classes, &varmap)?;
        let params = named_vars(&varmap)?;
        params
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    fn run_worker(
        &self,
        mut member: Membership,
        store: Arc<GraphViewStore>,
        seeds: WorkerSeeds,
        init: &[(String, Tensor)],
        n_classes: usize,
    ) -> Result<WorkerReport> {
        let config = &self.config;
        let rank = member.rank();
        let mut varmap = VarMap::new();
        let model = self.build_model(store.feature_dim(), n_classes, &varmap)?;
        for (name, value) in init {
            varmap.set_one(name, value)?;
        }
        let vars: Vec<Var> = named_vars(&varmap)?.into_iter().map(|(_, v)| v).collect();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.decay,
                ..Default::default()
            },
        )?;

        let fanout = config.fanout()?;
        let loader = MultiViewLoader::single(
            Arc::clone(&store),
            seeds.train.clone(),
            config.batch_size,
            fanout,
            config.shuffle,
            config.drop_last,
        )?;
        let mut controller = AugmentationController::metropolis(
            config.augment.clone(),
            &store,
            rank,
            self.device.clone(),
            config.seed ^ (rank as u64).wrapping_mul(0x9E37_79B9),
        )?;
        let weights = LossWeights {
            kl: config.kl,
            h: config.h,
        };

        let mut epochs = Vec::with_capacity(config.num_epochs);
        let mut eval = EvalCounts::default();
        let mut commits = 0;
        let mut throughput: VecDeque<f64> = VecDeque::with_capacity(config.log_every);
        let mut step_times: VecDeque<f64> = VecDeque::with_capacity(config.log_every);

        for epoch in 1..=config.num_epochs {
            member.barrier()?;
            let tic = Instant::now();
            let seed = epoch_seed(config.seed, rank, epoch);

            let decision = controller.step(&model, &loader, seed)?;
            commits += usize::from(decision.committed);
            let mode = decision.mode(config.option_loss);

            let sample_start = Instant::now();
            let (version, masks) = store.masks().current()?;
            let aligned =
                loader.drain_with(&ViewWeights::from_masks(&masks), version, seed, None)?;
            let mut stats = EpochAccumulator {
                sample_time: sample_start.elapsed().as_secs_f64(),
                ..EpochAccumulator::default()
            };
            let prev_nmask = masks.get(View::Prev, MaskKind::Node);
            let cur_nmask = masks.get(View::Cur, MaskKind::Node);

            for (step, triple) in aligned.iter().enumerate() {
                let tic_step = Instant::now();
                let labels = seed_labels(&store, triple.seeds(), &self.device)?;
                let org_x = view_inputs(&store, triple.org, None, &self.device)?;
                let prev_x = view_inputs(&store, triple.prev, Some(prev_nmask), &self.device)?;
                let cur_x = view_inputs(&store, triple.cur, Some(cur_nmask), &self.device)?;

                let org = model.forward_t(&triple.org.blocks, &org_x, true)?;
                let prev = model.forward_t(&triple.prev.blocks, &prev_x, true)?;
                let cur = model.forward_t(&triple.cur.blocks, &cur_x, true)?;
                let terms = assemble(&org, &prev, &cur, &labels, mode, weights)?;
                let forward_end = Instant::now();

                let mut grads = terms.total.backward()?;
                let backward_end = Instant::now();

                let mut flat = Vec::with_capacity(vars.len());
                for var in &vars {
                    flat.push(match grads.get(var.as_tensor()) {
                        Some(g) => g.flatten_all()?.to_vec1::<f32>()?,
                        None => vec![0.0; var.elem_count()],
                    });
                }
                member.all_reduce_mean(&mut flat)?;
                self.apply_mean(&vars, flat, &mut grads, &mut optimizer)?;
                let update_end = Instant::now();

                let num_seeds = triple.seeds().len();
                let loss = f64::from(terms.total.to_scalar::<f32>()?);
                let acc = accuracy(&org, &labels)?;
                stats.record(StepTiming {
                    forward: (forward_end - tic_step).as_secs_f64(),
                    backward: (backward_end - forward_end).as_secs_f64(),
                    update: (update_end - backward_end).as_secs_f64(),
                });
                stats.loss += loss;
                stats.acc += acc;
                stats.num_seeds += num_seeds;
                stats.num_inputs += triple.org.input_nodes.len();

                let step_time = tic_step.elapsed().as_secs_f64();
                push_window(&mut step_times, step_time, config.log_every);
                push_window(
                    &mut throughput,
                    num_seeds as f64 / step_time.max(f64::EPSILON),
                    config.log_every,
                );
                if (step + 1) % config.log_every == 0 {
                    tracing::info!(
                        part = rank,
                        epoch,
                        step,
                        loss,
                        train_acc = acc,
                        speed = mean(&throughput),
                        mean_step_time = mean(&step_times),
                        "train step"
                    );
                }
            }
            let shadow_steps = self.shadow_peers(&mut member, &vars, &mut optimizer)?;
            member.leave()?;
            if shadow_steps > 0 {
                tracing::debug!(part = rank, epoch, shadow_steps, "followed peer updates");
            }

            let stats = stats.finish(rank, epoch, &aligned, tic, &decision);
            tracing::info!(
                part = rank,
                epoch,
                epoch_time = stats.epoch_time,
                sample = stats.sample_time,
                forward = stats.forward_time,
                backward = stats.backward_time,
                update = stats.update_time,
                num_seeds = stats.num_seeds,
                num_inputs = stats.num_inputs,
                "epoch finished"
            );
            epochs.push(stats);

            if epoch % config.eval_every == 0 || epoch == config.num_epochs {
                let start = Instant::now();
                eval = EvalCounts {
                    val_correct: self.evaluate(&model, &store, &seeds.val, seed)?,
                    val_total: seeds.val.len(),
                    test_correct: self.evaluate(&model, &store, &seeds.test, seed)?,
                    test_total: seeds.test.len(),
                };
                tracing::info!(
                    part = rank,
                    epoch,
                    val_acc = eval.val_acc(),
                    test_acc = eval.test_acc(),
                    time = start.elapsed().as_secs_f64(),
                    "evaluation"
                );
            }
        }

        let replica = named_vars(&varmap)?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
            .collect::<Result<Replica>>()?;
        Ok(WorkerReport {
            epochs,
            eval,
            commits,
            replica,
        })
    }

    /// Overwrite `grads` with the averaged gradients and take an optimizer step.
    fn apply_mean(
        &self,
        vars: &[Var],
        means: Vec<Vec<f32>>,
        grads: &mut GradStore,
        optimizer: &mut AdamW,
    ) -> Result<()> {
        for (var, mean) in vars.iter().zip(means) {
            let grad = Tensor::from_vec(mean, var.shape(), &self.device)?;
            grads.insert(var.as_tensor(), grad);
        }
        optimizer.step(grads)?;
        Ok(())
    }

    /// Apply the updates of peers that still have batches; returns how many.
    fn shadow_peers(
        &self,
        member: &mut Membership,
        vars: &[Var],
        optimizer: &mut AdamW,
    ) -> Result<usize> {
        let mut steps = 0;
        loop {
            let mut flat: Vec<Vec<f32>> =
                vars.iter().map(|v| vec![0.0; v.elem_count()]).collect();
            if member.join(&mut flat)?.is_none() {
                return Ok(steps);
            }
            let mut grads = gradient_slots(vars)?;
            self.apply_mean(vars, flat, &mut grads, optimizer)?;
            steps += 1;
        }
    }

    /// Correct predictions on `seeds` using full neighborhoods on the org view.
    fn evaluate(
        &self,
        model: &dyn NodeClassifier,
        store: &GraphViewStore,
        seeds: &[NodeId],
        seed: u64,
    ) -> Result<usize> {
        let sampler = NeighborSampler::new(vec![usize::MAX; self.config.num_layers]);
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut hits = 0;
        for chunk in seeds.chunks(self.config.batch_size_eval) {
            let view = sampler.sample(store, chunk, None, &mut rng)?;
            let x = view_inputs(store, &view, None, &self.device)?;
            let logits = model.forward_t(&view.blocks, &x, false)?;
            hits += correct(&logits, &seed_labels(store, chunk, &self.device)?)?;
        }
        Ok(hits)
    }
}

/// A gradient store with an entry for every var, to be overwritten.
fn gradient_slots(vars: &[Var]) -> Result<GradStore> {
    let mut total: Option<Tensor> = None;
    for var in vars {
        let sum = var.as_tensor().sum_all()?;
        total = Some(match total {
            Some(t) => (t + sum)?,
            None => sum,
        });
    }
    let total = total.ok_or_else(|| Error::Training("model has no parameters".into()))?;
    Ok(total.backward()?)
}

/// First rank whose parameters differ from rank 0's.
fn diverged_replica(replicas: &[Replica]) -> Option<usize> {
    let first = replicas.first()?;
    replicas.iter().position(|r| r != first)
}

/// Variables of `varmap` sorted by name, so every worker sees the same order.
fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Training("parameter map lock poisoned".into()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn epoch_seed(base: u64, rank: usize, epoch: usize) -> u64 {
    base.wrapping_mul(0x2545_F491_4F6C_DD1D)
        .wrapping_add((epoch as u64) << 20)
        .wrapping_add(rank as u64)
}

/// Mean of the last 80% of rank 0's epoch times (all of them if that is none).
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn mean_epoch_time(epochs: &[EpochStats], num_epochs: usize) -> f64 {
    let times: Vec<f64> = epochs
        .iter()
        .filter(|e| e.rank == 0)
        .map(|e| e.epoch_time)
        .collect();
    let keep = (num_epochs as f64 * 0.8) as usize;
    let tail = if keep == 0 || keep >= times.len() {
        &times[..]
    } else {
        &times[times.len() - keep..]
    };
    if tail.is_empty() {
        0.0
    } else {
        tail.iter().sum::<f64>() / tail.len() as f64
    }
}

fn push_window(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    if window.len() == cap {
        window.pop_front();
    }
    window.push_back(value);
}

#[allow(clippy::cast_precision_loss)]
fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

struct StepTiming {
    forward: f64,
    backward: f64,
    update: f64,
}

#[derive(Default)]
struct EpochAccumulator {
    sample_time: f64,
    forward_time: f64,
    backward_time: f64,
    update_time: f64,
    loss: f64,
    acc: f64,
    num_seeds: usize,
    num_inputs: usize,
}

impl EpochAccumulator {
    fn record(&mut self, timing: StepTiming) {
        self.forward_time += timing.forward;
        self.backward_time += timing.backward;
        self.update_time += timing.update;
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(
        self,
        rank: usize,
        epoch: usize,
        aligned: &AlignedEpoch,
        started: Instant,
        decision: &Decision,
    ) -> EpochStats {
        let steps = aligned.len();
        let per_step = |total: f64| if steps == 0 { 0.0 } else { total / steps as f64 };
        EpochStats {
            rank,
            epoch,
            steps,
            loss: per_step(self.loss),
            train_acc: per_step(self.acc),
            epoch_time: started.elapsed().as_secs_f64(),
            sample_time: self.sample_time,
            forward_time: self.forward_time,
            backward_time: self.backward_time,
            update_time: self.update_time,
            num_seeds: self.num_seeds,
            num_inputs: self.num_inputs,
            teacher: decision.teacher,
            mask_version: aligned.mask_version(),
            attempts: decision.attempts,
        }
    }
}
