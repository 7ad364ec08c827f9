//! Exact hypervolume indicator and the per-run progress log built on it.

use crate::{
  individual::Individual,
  score::{minimization, worst_values, Score},
};

/// Volume of the region dominated by `points` and bounded by `reference`,
/// all objectives minimized. Points that do not strictly dominate the
/// reference contribute nothing.
pub fn hypervolume(points: &[Vec<Score>], reference: &[Score]) -> f64 {
  let points: Vec<&[Score]> = points
    .iter()
    .filter(|p| p.len() == reference.len())
    .filter(|p| p.iter().zip(reference).all(|(x, r)| x < r))
    .map(Vec::as_slice)
    .collect();
  volume(&points, reference)
}

// slices along the last objective and recurses on the rest
fn volume(points: &[&[Score]], reference: &[Score]) -> f64 {
  let d = reference.len();
  match d {
    0 => 0.0,
    1 => points.iter().map(|p| reference[0] - p[0]).fold(0.0, f64::max),
    2 => {
      let mut sorted = points.to_vec();
      sorted.sort_by(|a, b| a[0].total_cmp(&b[0]));
      let mut ceiling = reference[1];
      let mut area = 0.0;
      for p in sorted {
        if p[1] < ceiling {
          area += (reference[0] - p[0]) * (ceiling - p[1]);
          ceiling = p[1];
        }
      }
      area
    }
    _ => {
      let last = d - 1;
      let mut sorted = points.to_vec();
      sorted.sort_by(|a, b| a[last].total_cmp(&b[last]));
      let mut total = 0.0;
      for i in 0..sorted.len() {
        let upper = sorted.get(i + 1).map_or(reference[last], |p| p[last]);
        let height = upper - sorted[i][last];
        if height <= 0.0 {
          continue;
        }
        let slice: Vec<&[Score]> =
          sorted[..=i].iter().map(|p| &p[..last]).collect();
        total += volume(&slice, &reference[..last]) * height;
      }
      total
    }
  }
}

/// Records the hypervolume of successive populations against a reference
/// point fixed on the first call.
#[derive(Clone, Debug, Default)]
pub struct HypervolumeLog {
  weights: Vec<f64>,
  reference: Option<Vec<Score>>,
  log: Vec<f64>,
}

impl HypervolumeLog {
  pub fn new(weights: Vec<f64>) -> Self {
    Self {
      weights,
      reference: None,
      log: Vec::new(),
    }
  }

  /// Reference point in minimization space, once set.
  pub fn reference(&self) -> Option<&[Score]> {
    self.reference.as_deref()
  }

  pub fn values(&self) -> &[f64] {
    &self.log
  }

  /// Appends the hypervolume of the evaluated members of `population`. The
  /// first call fixes the reference point at the per-objective worst values.
  pub fn record(&mut self, population: &[Individual]) -> f64 {
    let fitnesses: Vec<&[Score]> =
      population.iter().filter_map(Individual::fitness).collect();
    if self.reference.is_none() && !fitnesses.is_empty() {
      let worst = worst_values(&fitnesses, &self.weights);
      self.reference = Some(minimization(&worst, &self.weights));
    }

    let value = match &self.reference {
      Some(reference) => {
        let points: Vec<Vec<Score>> = fitnesses
          .iter()
          .map(|f| minimization(f, &self.weights))
          .collect();
        hypervolume(&points, reference)
      }
      None => 0.0,
    };
    self.log.push(value);
    value
  }
}
