// --- Telemetry & Run Summaries ---

use crate::aggregator::{DistanceMatrix, FilterRule};
use crate::error::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Byzantine detection quality against ground-truth labels. A flagged
/// worker is a positive. Undefined ratios are reported as 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl DetectionScores {
    pub fn compute(is_byzantine: &[bool], good_set: &[bool]) -> Self {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        for (&truth, &good) in is_byzantine.iter().zip(good_set) {
            match (truth, !good) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        DetectionScores { precision, recall, f1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DistanceStats {
    pub mean: f64,
    pub max: f64,
}

impl DistanceStats {
    fn over<I: Iterator<Item = f64>>(values: I) -> Option<Self> {
        let (sum, max, n) = values.fold((0.0, f64::NEG_INFINITY, 0usize), |(s, m, n), d| (s + d, m.max(d), n + 1));
        if n == 0 {
            None
        } else {
            Some(DistanceStats { mean: sum / n as f64, max })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupDistances {
    pub byzantine: Option<DistanceStats>,
    pub honest: Option<DistanceStats>,
    pub between: Option<DistanceStats>,
    pub all: Option<DistanceStats>,
}

impl GroupDistances {
    pub fn compute(distances: &DistanceMatrix, is_byzantine: &[bool]) -> Self {
        let n = distances.size();
        let block = |row: bool, col: bool| {
            DistanceStats::over(
                (0..n)
                    .filter(move |&i| is_byzantine[i] == row)
                    .flat_map(move |i| (0..n).filter(move |&j| is_byzantine[j] == col).map(move |j| distances.get(i, j))),
            )
        };
        GroupDistances {
            byzantine: block(true, true),
            honest: block(false, false),
            between: block(true, false),
            all: DistanceStats::over((0..n).flat_map(|i| (0..n).map(move |j| distances.get(i, j)))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTelemetry {
    pub run: usize,
    pub epoch: usize,
    /// Cumulative trajectory count after this round.
    pub step: usize,
    pub batch_size: usize,
    pub mean_loss: f64,
    pub mean_return: f64,
    pub mean_length: f64,
    pub good_count: usize,
    pub rule: FilterRule,
    pub threshold: Option<f64>,
    pub detection: Option<DetectionScores>,
    pub distances: GroupDistances,
    pub lr: f64,
    pub inner_steps: usize,
    pub early_stopped: bool,
    pub mean_grad: f64,
    pub val_return: Option<f64>,
    pub val_length: Option<f64>,
}

pub trait TelemetrySink {
    fn record(&mut self, telemetry: &RoundTelemetry) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&mut self, t: &RoundTelemetry) -> Result<()> {
        info!(
            "[Master] run {} epoch {:3} step {:6} | loss {:8.3} return {:8.3} ep_len {:6.1} | N_good {} ({:?}) N_t {}",
            t.run, t.epoch, t.step, t.mean_loss, t.mean_return, t.mean_length, t.good_count, t.rule, t.inner_steps
        );
        if let Some(d) = &t.detection {
            info!(
                "[Filter] precision {:.3} recall {:.3} f1 {:.3} threshold {:.4}",
                d.precision,
                d.recall,
                d.f1,
                t.threshold.unwrap_or(f64::NAN)
            );
        }
        if let (Some(r), Some(l)) = (t.val_return, t.val_length) {
            info!("[Master] validation return {:.3} ep_len {:.1}", r, l);
        }
        Ok(())
    }
}

pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(JsonlSink {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl TelemetrySink for JsonlSink {
    fn record(&mut self, telemetry: &RoundTelemetry) -> Result<()> {
        serde_json::to_writer(&mut self.writer, telemetry)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunLog {
    pub run: usize,
    pub seed: u64,
    pub rounds: Vec<RoundTelemetry>,
}

impl RunLog {
    pub fn new(run: usize, seed: u64) -> Self {
        RunLog {
            run,
            seed,
            rounds: Vec::new(),
        }
    }

    pub fn push(&mut self, telemetry: RoundTelemetry) {
        self.rounds.push(telemetry);
    }

    pub fn last_step(&self) -> usize {
        self.rounds.last().map(|r| r.step).unwrap_or(0)
    }

    pub fn training_curve(&self) -> Vec<(f64, f64)> {
        self.rounds.iter().map(|r| (r.step as f64, r.mean_return)).collect()
    }

    pub fn validation_curve(&self) -> Vec<(f64, f64)> {
        self.rounds
            .iter()
            .filter_map(|r| r.val_return.map(|v| (r.step as f64, v)))
            .collect()
    }
}

/// Mean curve and 90% normal confidence band over runs, on a shared grid of
/// trajectory counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub grid: Vec<f64>,
    pub mean: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

// Two-sided 90% quantile of the standard normal.
const Z_90: f64 = 1.644_853_626_951_472_2;

impl Band {
    pub fn from_curves(curves: &[Vec<(f64, f64)>], max_step: f64, points: usize) -> Self {
        let curves: Vec<&Vec<(f64, f64)>> = curves.iter().filter(|c| !c.is_empty()).collect();
        if curves.is_empty() || points == 0 {
            return Band::default();
        }
        let grid: Vec<f64> = if points == 1 {
            vec![0.0]
        } else {
            (0..points).map(|i| max_step * i as f64 / (points - 1) as f64).collect()
        };

        let n = curves.len() as f64;
        let mut band = Band {
            grid: grid.clone(),
            ..Default::default()
        };
        for &x in &grid {
            let ys: Vec<f64> = curves.iter().map(|c| interpolate(c, x)).collect();
            let mean = ys.iter().sum::<f64>() / n;
            let sem = if ys.len() > 1 {
                let var = ys.iter().map(|y| (y - mean) * (y - mean)).sum::<f64>() / (n - 1.0);
                (var / n).sqrt()
            } else {
                0.0
            };
            band.mean.push(mean);
            band.lower.push(mean - Z_90 * sem);
            band.upper.push(mean + Z_90 * sem);
        }
        band
    }
}

/// Piecewise-linear interpolation, flat beyond the recorded range.
fn interpolate(curve: &[(f64, f64)], x: f64) -> f64 {
    let first = curve[0];
    let last = curve[curve.len() - 1];
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }
    for w in curve.windows(2) {
        let ((x0, y0), (x1, y1)) = (w[0], w[1]);
        if x >= x0 && x <= x1 {
            if x1 == x0 {
                return y1;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    last.1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub runs: usize,
    pub training: Band,
    pub validation: Band,
}

impl PerformanceSummary {
    pub fn from_runs(runs: &[RunLog], max_step: usize, points: usize) -> Self {
        let training: Vec<_> = runs.iter().map(|r| r.training_curve()).collect();
        let validation: Vec<_> = runs.iter().map(|r| r.validation_curve()).collect();
        PerformanceSummary {
            runs: runs.len(),
            training: Band::from_curves(&training, max_step as f64, points),
            validation: Band::from_curves(&validation, max_step as f64, points),
        }
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
