use comms::ProcessGroup;
use ndarray::ArrayView2;

/// Running sums of an epoch; metrics are derived from them once the epoch ends.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct EpochStats {
    /// Sum over batches of the mean batch loss times the batch size.
    pub loss_sum: f32,
    pub samples: usize,
    pub correct: usize,
    pub correct_topk: usize,
}

impl EpochStats {
    pub fn add(&mut self, other: EpochStats) {
        self.loss_sum += other.loss_sum;
        self.samples += other.samples;
        self.correct += other.correct;
        self.correct_topk += other.correct_topk;
    }

    /// Sums the stats of every member of `group`.
    pub fn all_reduce(&mut self, group: &dyn ProcessGroup) -> comms::Result<()> {
        let mut buf = [
            self.loss_sum,
            self.samples as f32,
            self.correct as f32,
            self.correct_topk as f32,
        ];
        group.all_reduce_sum(&mut buf)?;

        self.loss_sum = buf[0];
        self.samples = buf[1].round() as usize;
        self.correct = buf[2].round() as usize;
        self.correct_topk = buf[3].round() as usize;
        Ok(())
    }

    pub fn loss(&self) -> f32 {
        self.loss_sum / self.samples.max(1) as f32
    }

    pub fn accuracy(&self) -> f32 {
        self.correct as f32 / self.samples.max(1) as f32
    }

    pub fn topk_accuracy(&self) -> f32 {
        self.correct_topk as f32 / self.samples.max(1) as f32
    }
}

/// Counts the rows whose target class is the top prediction, and the rows
/// whose target class is among the `k` top predictions.
///
/// The target class of a row is its largest target value. Ties in the
/// prediction are resolved in favour of the target.
pub(crate) fn count_correct(
    pred: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    k: usize,
) -> (usize, usize) {
    let mut top1 = 0;
    let mut topk = 0;

    for (p, t) in pred.rows().into_iter().zip(targets.rows()) {
        let Some(label) = argmax(t.iter().copied()) else {
            continue;
        };

        let score = p[label];
        let above = p.iter().filter(|&&v| v > score).count();

        if above == 0 {
            top1 += 1;
        }
        if above < k {
            topk += 1;
        }
    }

    (top1, topk)
}

fn argmax<I: Iterator<Item = f32>>(values: I) -> Option<usize> {
    values
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}
