use serde::{Deserialize, Serialize};

/// Affinity (nM) at or below which a peptide counts as a binder.
pub const BINDER_THRESHOLD_NM: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingPhase {
    Train,
    Validation,
}

/// Per-epoch losses in a Struct of Arrays layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<usize>,
    pub phases: Vec<TrainingPhase>,
    pub losses: Vec<f32>,
    pub learning_rates: Vec<f64>,
    /// Epoch whose weights were kept after early stopping.
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f32>,
}

impl TrainingHistory {
    pub fn record(&mut self, epoch: usize, phase: TrainingPhase, loss: f32, learning_rate: f64) {
        self.epochs.push(epoch);
        self.phases.push(phase);
        self.losses.push(loss);
        self.learning_rates.push(learning_rate);
    }

    pub fn num_epochs(&self) -> usize {
        self.epochs.iter().max().map_or(0, |e| e + 1)
    }

    /// Losses of one phase, in epoch order.
    pub fn losses_for(&self, phase: TrainingPhase) -> Vec<(usize, f32)> {
        self.epochs
            .iter()
            .zip(&self.phases)
            .zip(&self.losses)
            .filter(|((_, p), _)| **p == phase)
            .map(|((e, _), l)| (*e, *l))
            .collect()
    }

    /// Returns (epoch, avg_train_loss, avg_val_loss) rows.
    pub fn summarize_loss_for_plotting(&self) -> Vec<(usize, f32, Option<f32>)> {
        let train = self.losses_for(TrainingPhase::Train);
        let val = self.losses_for(TrainingPhase::Validation);
        train
            .into_iter()
            .map(|(epoch, loss)| {
                let val_loss = val.iter().find(|(e, _)| *e == epoch).map(|(_, l)| *l);
                (epoch, loss, val_loss)
            })
            .collect()
    }
}

/// Summary of how well predicted affinities track measured ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub auc: Option<f64>,
    pub f1: Option<f64>,
    pub tau: Option<f64>,
}

/// AUC and F1 at the binder threshold, plus Kendall tau over raw values.
///
/// Metrics that are undefined for the inputs (a single class, no predicted
/// binders, constant series) come back as `None`.
pub fn make_scores(ic50_true: &[f64], ic50_pred: &[f64]) -> Scores {
    let truth: Vec<bool> = ic50_true.iter().map(|v| *v <= BINDER_THRESHOLD_NM).collect();
    let called: Vec<bool> = ic50_pred.iter().map(|v| *v <= BINDER_THRESHOLD_NM).collect();
    // lower nM = stronger binder = higher score
    let scores: Vec<f64> = ic50_pred.iter().map(|v| -v).collect();
    Scores {
        auc: Metrics::roc_auc(&truth, &scores),
        f1: Metrics::f1(&truth, &called),
        tau: Metrics::kendall_tau(ic50_true, ic50_pred),
    }
}

pub struct Metrics;

impl Metrics {
    /// Mann-Whitney formulation; ties count half.
    pub fn roc_auc(labels: &[bool], scores: &[f64]) -> Option<f64> {
        let positives: Vec<f64> = labels
            .iter()
            .zip(scores)
            .filter(|(l, _)| **l)
            .map(|(_, s)| *s)
            .collect();
        let negatives: Vec<f64> = labels
            .iter()
            .zip(scores)
            .filter(|(l, _)| !**l)
            .map(|(_, s)| *s)
            .collect();
        if positives.is_empty() || negatives.is_empty() {
            return None;
        }
        let mut wins = 0.0;
        for p in &positives {
            for n in &negatives {
                if p > n {
                    wins += 1.0;
                } else if p == n {
                    wins += 0.5;
                }
            }
        }
        Some(wins / (positives.len() * negatives.len()) as f64)
    }

    pub fn f1(truth: &[bool], called: &[bool]) -> Option<f64> {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        for (&t, &c) in truth.iter().zip(called) {
            match (t, c) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                _ => {}
            }
        }
        if 2 * tp + fp + fn_ == 0 {
            return None;
        }
        Some(2.0 * tp as f64 / (2 * tp + fp + fn_) as f64)
    }

    /// Kendall tau-b.
    pub fn kendall_tau(x: &[f64], y: &[f64]) -> Option<f64> {
        let n = x.len().min(y.len());
        let (mut concordant, mut discordant) = (0i64, 0i64);
        let (mut ties_x, mut ties_y) = (0i64, 0i64);
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = x[i] - x[j];
                let dy = y[i] - y[j];
                if dx == 0.0 && dy == 0.0 {
                    continue;
                } else if dx == 0.0 {
                    ties_x += 1;
                } else if dy == 0.0 {
                    ties_y += 1;
                } else if (dx > 0.0) == (dy > 0.0) {
                    concordant += 1;
                } else {
                    discordant += 1;
                }
            }
        }
        let denom = (((concordant + discordant + ties_x) * (concordant + discordant + ties_y))
            as f64)
            .sqrt();
        if denom == 0.0 {
            return None;
        }
        Some((concordant - discordant) as f64 / denom)
    }
}
