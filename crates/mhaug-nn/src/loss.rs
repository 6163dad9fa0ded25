//! Composite loss over the three prediction streams.
//!
//! ```text
//! total = CE(prev, labels) + kl * consistency(prev, cur) + h * H(org)
//! ```
//!
//! The consistency term depends on the augmentation decision of the current
//! iteration ([`ConsistencyMode`]). In the asymmetric mode the teacher stream
//! is detached, so its gradient is exactly zero while the student's is not.
//! Nothing here reads or writes masks.

use crate::{Error, Result};
use candle_core::{Tensor, D};
use candle_nn::{loss, ops};
use mhaug_core::View;
use serde::{Deserialize, Serialize};

/// Which consistency loss is active, and which side (if any) is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyMode {
    /// Soft cross-entropy between prev and cur; gradients through both.
    JointSoftLoss,
    /// Jensen-Shannon divergence with `teacher` (prev or cur) detached.
    AsymmetricDivergence { teacher: View },
}

impl ConsistencyMode {
    /// Mode for `option_loss` (0 = joint) given the controller's teacher.
    pub fn select(option_loss: u8, teacher: View) -> Self {
        if option_loss == 0 {
            Self::JointSoftLoss
        } else {
            Self::AsymmetricDivergence { teacher }
        }
    }

    /// Consistency term between the prev and cur logits.
    pub fn consistency(&self, prev: &Tensor, cur: &Tensor) -> Result<Tensor> {
        match *self {
            Self::JointSoftLoss => soft_cross_entropy(prev, cur),
            Self::AsymmetricDivergence { teacher: View::Prev } => {
                jensen_shannon(&prev.detach(), cur)
            }
            Self::AsymmetricDivergence { teacher: View::Cur } => {
                jensen_shannon(prev, &cur.detach())
            }
            Self::AsymmetricDivergence { teacher: View::Org } => Err(Error::InvalidConfig(
                "the consistency teacher must be prev or cur".into(),
            )),
        }
    }
}

/// Weights of the consistency and entropy terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub kl: f64,
    pub h: f64,
}

/// The assembled loss and its parts.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub hard: Tensor,
    pub consistency: Tensor,
    pub entropy: Tensor,
    pub total: Tensor,
}

impl LossTerms {
    /// Scalar values `(hard, consistency, entropy, total)` for logging.
    pub fn values(&self) -> Result<(f32, f32, f32, f32)> {
        Ok((
            self.hard.to_scalar::<f32>()?,
            self.consistency.to_scalar::<f32>()?,
            self.entropy.to_scalar::<f32>()?,
            self.total.to_scalar::<f32>()?,
        ))
    }
}

/// Build the total loss for one step.
///
/// All three logit tensors must have one row per seed, in the same order.
pub fn assemble(
    org: &Tensor,
    prev: &Tensor,
    cur: &Tensor,
    labels: &Tensor,
    mode: ConsistencyMode,
    weights: LossWeights,
) -> Result<LossTerms> {
    let rows = labels.dim(0)?;
    for (name, logits) in [("org", org), ("prev", prev), ("cur", cur)] {
        if logits.dim(0)? != rows {
            return Err(Error::Training(format!(
                "{name} logits have {} rows, batch has {rows} seeds",
                logits.dim(0)?
            )));
        }
    }

    let hard = loss::cross_entropy(prev, labels)?;
    let consistency = mode.consistency(prev, cur)?;
    let entropy = entropy(org)?;
    let total = ((&hard + (&consistency * weights.kl)?)? + (&entropy * weights.h)?)?;
    Ok(LossTerms {
        hard,
        consistency,
        entropy,
        total,
    })
}

/// `-(softmax(target) * log_softmax(logits)).sum(1).mean()`.
pub fn soft_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_p = ops::log_softmax(logits, D::Minus1)?;
    let q = ops::softmax(target, D::Minus1)?;
    Ok((log_p * q)?.sum(D::Minus1)?.mean_all()?.neg()?)
}

/// Mean Shannon entropy of the row-wise softmax.
pub fn entropy(logits: &Tensor) -> Result<Tensor> {
    let log_p = ops::log_softmax(logits, D::Minus1)?;
    let p = log_p.exp()?;
    Ok((p * log_p)?.sum(D::Minus1)?.mean_all()?.neg()?)
}

/// Mean row-wise `KL(softmax(p) || softmax(q))`.
pub fn kl_divergence(p_logits: &Tensor, q_logits: &Tensor) -> Result<Tensor> {
    let log_p = ops::log_softmax(p_logits, D::Minus1)?;
    let log_q = ops::log_softmax(q_logits, D::Minus1)?;
    let p = log_p.exp()?;
    Ok((p * (log_p - log_q)?)?.sum(D::Minus1)?.mean_all()?)
}

/// Mean row-wise Jensen-Shannon divergence between the two softmaxes.
pub fn jensen_shannon(p_logits: &Tensor, q_logits: &Tensor) -> Result<Tensor> {
    let log_p = ops::log_softmax(p_logits, D::Minus1)?;
    let log_q = ops::log_softmax(q_logits, D::Minus1)?;
    let p = log_p.exp()?;
    let q = log_q.exp()?;
    let log_m = (((&p + &q)? * 0.5)? + 1e-12)?.log()?;
    let kl_pm = (&p * (log_p - &log_m)?)?.sum(D::Minus1)?;
    let kl_qm = (&q * (log_q - &log_m)?)?.sum(D::Minus1)?;
    Ok(((kl_pm + kl_qm)? * 0.5)?.mean_all()?)
}
