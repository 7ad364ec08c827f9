//! Fitness scores and weighted Pareto dominance.
//!
//! Every objective carries a weight. A positive weight maximizes the
//! objective, a non-positive weight minimizes it. Weighted values `f * w` are
//! compared with "greater is better" semantics.

use std::cmp::Ordering;

/// An alias for a fitness score.
pub type Score = f64;

/// An alias for a fitness vector, one score per objective.
pub type Scores = Vec<Score>;

/// Describes weighted pareto dominance for slices of `Score`.
pub trait ParetoDominance {
  /// Returns `Less` if `self` dominates `other`, `Greater` if `other`
  /// dominates `self`, otherwise `Equal`. `self` dominates `other` if none of
  /// its weighted values is worse and at least one is better.
  fn dominance(&self, other: &Self, weights: &[f64]) -> Ordering;
}

impl ParetoDominance for [Score] {
  fn dominance(&self, other: &Self, weights: &[f64]) -> Ordering {
    let mut ord = Ordering::Equal;
    for ((a, b), w) in self.iter().zip(other).zip(weights) {
      // reversed: a larger weighted value is the better one
      let next_ord = (b * w).partial_cmp(&(a * w)).unwrap_or(Ordering::Equal);
      match (ord, next_ord) {
        (Ordering::Equal, next_ord) => ord = next_ord,
        (Ordering::Greater, Ordering::Less)
        | (Ordering::Less, Ordering::Greater) => return Ordering::Equal,
        _ => {}
      }
    }
    ord
  }
}

/// Per-objective worst value of `fitnesses`: the maximum for objectives with
/// a non-positive weight, the minimum otherwise.
pub fn worst_values(fitnesses: &[&[Score]], weights: &[f64]) -> Scores {
  weights
    .iter()
    .enumerate()
    .map(|(i, &w)| {
      let column = fitnesses.iter().map(|f| f[i]);
      if w <= 0.0 {
        column.fold(f64::NEG_INFINITY, f64::max)
      } else {
        column.fold(f64::INFINITY, f64::min)
      }
    })
    .collect()
}

/// Per-objective best value of `fitnesses`, mirroring [`worst_values`].
pub fn best_values(fitnesses: &[&[Score]], weights: &[f64]) -> Scores {
  let flipped: Vec<f64> = weights
    .iter()
    .map(|&w| if w <= 0.0 { 1.0 } else { -1.0 })
    .collect();
  worst_values(fitnesses, &flipped)
}

/// Maps scores into a space where every objective is minimized.
pub fn minimization(scores: &[Score], weights: &[f64]) -> Scores {
  scores.iter().zip(weights).map(|(f, w)| -f * w).collect()
}

#[cfg(test)]
mod tests {
  use std::cmp::Ordering;

  use super::*;

  #[test]
  fn test_pareto_dominance() {
    let min = [-1.0, -1.0, -1.0];
    assert_eq!([1.0, 2.0, 3.0].dominance(&[1.0, 2.0, 3.0], &min), Ordering::Equal);
    assert_eq!([1.0, 2.0, 3.0].dominance(&[3.0, 2.0, 1.0], &min), Ordering::Equal);
    assert_eq!(
      [10.0, 2.0, 3.0].dominance(&[1.0, 2.0, 3.0], &min),
      Ordering::Greater
    );
    assert_eq!([1.0, 2.0, 3.0].dominance(&[1.0, 20.0, 3.0], &min), Ordering::Less);
    assert_eq!([1.0, 2.0, 3.0].dominance(&[1.0, 2.0, 30.0], &min), Ordering::Less);

    let max = [1.0, 1.0, 1.0];
    assert_eq!(
      [10.0, 2.0, 3.0].dominance(&[1.0, 2.0, 3.0], &max),
      Ordering::Less
    );

    let mixed = [1.0, -1.0];
    assert_eq!([5.0, 1.0].dominance(&[4.0, 2.0], &mixed), Ordering::Less);
    assert_eq!([5.0, 3.0].dominance(&[4.0, 2.0], &mixed), Ordering::Equal);

    assert_eq!([1.0; 0].dominance(&[0.0; 0], &[]), Ordering::Equal);
  }

  #[test]
  fn test_worst_and_best_values() {
    let fs: Vec<&[f64]> = vec![&[1.0, 5.0], &[3.0, 2.0]];
    assert_eq!(worst_values(&fs, &[1.0, -1.0]), [1.0, 5.0]);
    assert_eq!(best_values(&fs, &[1.0, -1.0]), [3.0, 2.0]);
    assert_eq!(worst_values(&fs, &[0.0, 1.0]), [3.0, 2.0]);
  }

  #[test]
  fn test_minimization() {
    assert_eq!(minimization(&[2.0, 3.0], &[1.0, -1.0]), [-2.0, 3.0]);
  }
}
