//! Collapsing fitness vectors into a single scalar to minimize.

use tracing::info;

use crate::{
  protocol::{Objective, Solution},
  score::{best_values, worst_values, Score},
};

/// Augmentation coefficient of the achievement scalarizing function.
pub const AUGMENTATION: f64 = 1e-5;

/// A scalarizing function. Smaller scalars are better.
#[derive(Clone, Debug, PartialEq)]
pub enum Scalarization {
  /// `max_i((f_i - target_i) / (nadir_i - utopian_i)) + p * sum_i(f_i / (nadir_i - utopian_i))`
  Achievement {
    targets: Vec<f64>,
    nadir: Vec<f64>,
    utopian: Vec<f64>,
  },
  /// `sum_i(-f_i * w_i)`
  Linear { weights: Vec<f64> },
}

impl Scalarization {
  /// Achievement scalarization when every objective has a target and the
  /// prior solutions span a range on every objective, linear otherwise.
  pub fn for_objectives(objectives: &[Objective], prior: &[Solution]) -> Self {
    let weights: Vec<f64> = objectives.iter().map(|o| o.weight).collect();
    let targets: Option<Vec<f64>> =
      objectives.iter().map(|o| o.target).collect();
    let fitnesses: Vec<&[Score]> = prior
      .iter()
      .map(|s| s.fitness.as_slice())
      .filter(|f| f.len() == weights.len())
      .collect();

    match targets {
      Some(targets) if !fitnesses.is_empty() => {
        let (nadir, utopian) = nadir_utopian(&fitnesses, &weights);
        let degenerate = nadir
          .iter()
          .zip(&utopian)
          .any(|(n, u)| (n - u).abs() <= f64::EPSILON);
        if degenerate {
          info!(?nadir, ?utopian, "degenerate prior range, using linear scalarization");
          return Scalarization::Linear { weights };
        }
        info!(?targets, ?nadir, ?utopian, "using achievement scalarization");
        Scalarization::Achievement {
          targets,
          nadir,
          utopian,
        }
      }
      _ => {
        info!(?weights, "using linear scalarization");
        Scalarization::Linear { weights }
      }
    }
  }

  pub fn scalarize(&self, fitness: &[Score]) -> f64 {
    match self {
      Scalarization::Achievement {
        targets,
        nadir,
        utopian,
      } => {
        let spans = nadir.iter().zip(utopian).map(|(n, u)| n - u);
        let (deviations, augmentation) = fitness
          .iter()
          .zip(targets)
          .zip(spans)
          .map(|((f, t), span)| ((f - t) / span, f / span))
          .fold((Vec::new(), 0.0), |(mut devs, sum), (dev, aug)| {
            devs.push(dev);
            (devs, sum + aug)
          });
        deviations
          .into_iter()
          .map(|dev| dev + AUGMENTATION * augmentation)
          .fold(f64::NEG_INFINITY, f64::max)
      }
      Scalarization::Linear { weights } => {
        fitness.iter().zip(weights).map(|(f, w)| -f * w).sum()
      }
    }
  }
}

/// Nadir and utopian vectors of `fitnesses`: per objective, the worst and the
/// best observed value under `weights`.
pub fn nadir_utopian(
  fitnesses: &[&[Score]],
  weights: &[f64],
) -> (Vec<f64>, Vec<f64>) {
  (
    worst_values(fitnesses, weights),
    best_values(fitnesses, weights),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn objective(weight: f64, target: Option<f64>) -> Objective {
    Objective {
      weight,
      target,
      summary_method: String::new(),
      penalty_value: None,
    }
  }

  fn solution(fitness: Vec<f64>) -> Solution {
    Solution {
      id: "s".into(),
      fitness,
      variables: vec![],
      objects: vec![],
      locally_optimized: false,
    }
  }

  #[test]
  fn test_achievement_adds_augmentation() {
    let asf = Scalarization::Achievement {
      targets: vec![0.0, 0.0],
      nadir: vec![10.0, 10.0],
      utopian: vec![0.0, 0.0],
    };
    let scalar = asf.scalarize(&[5.0, 5.0]);
    assert!((scalar - (0.5 + AUGMENTATION)).abs() < 1e-12);
    assert!(scalar > 0.5);
  }

  #[test]
  fn test_linear_negates_weights() {
    let linear = Scalarization::Linear {
      weights: vec![1.0, -2.0],
    };
    assert_eq!(linear.scalarize(&[3.0, 1.0]), -1.0);
  }

  #[test]
  fn test_mode_selection() {
    let with_targets = [objective(-1.0, Some(0.0)), objective(1.0, Some(1.0))];
    let prior = [solution(vec![1.0, 5.0]), solution(vec![3.0, 2.0])];
    assert_eq!(
      Scalarization::for_objectives(&with_targets, &prior),
      Scalarization::Achievement {
        targets: vec![0.0, 1.0],
        nadir: vec![3.0, 2.0],
        utopian: vec![1.0, 5.0],
      }
    );

    assert!(matches!(
      Scalarization::for_objectives(&with_targets, &[]),
      Scalarization::Linear { .. }
    ));
    // a single prior solution gives nadir == utopian
    assert!(matches!(
      Scalarization::for_objectives(&with_targets, &prior[..1]),
      Scalarization::Linear { .. }
    ));
    let missing_target = [objective(-1.0, Some(0.0)), objective(1.0, None)];
    assert!(matches!(
      Scalarization::for_objectives(&missing_target, &prior),
      Scalarization::Linear { .. }
    ));
  }

  #[test]
  fn test_single_prior_still_ranks_candidates() {
    let objectives = [objective(-1.0, Some(0.0)), objective(-1.0, Some(0.0))];
    let scalarization =
      Scalarization::for_objectives(&objectives, &[solution(vec![5.0, 5.0])]);
    let better = scalarization.scalarize(&[4.0, 4.0]);
    let worse = scalarization.scalarize(&[5.0, 5.0]);
    assert!(better.is_finite() && worse.is_finite());
    assert!(better < worse);
  }

  #[test]
  fn test_agreeing_priors_fall_back_to_linear() {
    let objectives = [objective(-1.0, Some(0.0)), objective(-1.0, Some(0.0))];
    let prior = [solution(vec![1.0, 3.0]), solution(vec![2.0, 3.0])];
    assert_eq!(
      Scalarization::for_objectives(&objectives, &prior),
      Scalarization::Linear {
        weights: vec![-1.0, -1.0]
      }
    );
  }
}
