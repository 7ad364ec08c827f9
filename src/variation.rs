//! Bounded real-coded variation operators and offspring generation.

use itertools::Itertools;
use rand::{seq::SliceRandom, Rng};

use crate::{codec::BoundSpec, individual::Individual};

/// Samples a decision vector uniformly within `bounds`. Integer variables get
/// integer values.
pub fn random_genes<R: Rng + ?Sized>(bounds: &[BoundSpec], rng: &mut R) -> Vec<f64> {
  bounds
    .iter()
    .map(|b| {
      if b.integer {
        let (lo, hi) = (b.lower.ceil() as i64, b.upper.floor() as i64);
        if lo >= hi {
          lo as f64
        } else {
          rng.gen_range(lo..=hi) as f64
        }
      } else if b.lower < b.upper {
        rng.gen_range(b.lower..=b.upper)
      } else {
        b.lower
      }
    })
    .collect()
}

/// Simulated binary crossover with bounds, applied per variable with
/// probability one half. Children are written back into `a` and `b`.
pub fn sbx_bounded<R: Rng + ?Sized>(
  a: &mut [f64],
  b: &mut [f64],
  bounds: &[BoundSpec],
  eta: f64,
  rng: &mut R,
) {
  let spread = |beta: f64, rand: f64| {
    let alpha = 2.0 - beta.powf(-(eta + 1.0));
    if rand <= 1.0 / alpha {
      (rand * alpha).powf(1.0 / (eta + 1.0))
    } else {
      (1.0 / (2.0 - rand * alpha)).powf(1.0 / (eta + 1.0))
    }
  };

  for ((x, y), bound) in a.iter_mut().zip(b.iter_mut()).zip(bounds) {
    let (xl, xu) = (bound.lower, bound.upper);
    if rng.gen::<f64>() > 0.5 || (*x - *y).abs() <= 1e-14 {
      continue;
    }
    let (x1, x2) = (x.min(*y), x.max(*y));
    let rand = rng.gen::<f64>();

    let beta_q = spread(1.0 + 2.0 * (x1 - xl) / (x2 - x1), rand);
    let c1 = (0.5 * (x1 + x2 - beta_q * (x2 - x1))).clamp(xl, xu);
    let beta_q = spread(1.0 + 2.0 * (xu - x2) / (x2 - x1), rand);
    let c2 = (0.5 * (x1 + x2 + beta_q * (x2 - x1))).clamp(xl, xu);

    if rng.gen::<f64>() <= 0.5 {
      (*x, *y) = (c2, c1);
    } else {
      (*x, *y) = (c1, c2);
    }
  }
}

/// Polynomial mutation with bounds, applied per variable with probability
/// `indpb`.
pub fn polynomial_bounded<R: Rng + ?Sized>(
  genes: &mut [f64],
  bounds: &[BoundSpec],
  eta: f64,
  indpb: f64,
  rng: &mut R,
) {
  let mut_pow = 1.0 / (eta + 1.0);
  for (x, bound) in genes.iter_mut().zip(bounds) {
    let (xl, xu) = (bound.lower, bound.upper);
    if rng.gen::<f64>() > indpb || xu <= xl {
      continue;
    }
    let delta_1 = (*x - xl) / (xu - xl);
    let delta_2 = (xu - *x) / (xu - xl);
    let rand = rng.gen::<f64>();
    let delta_q = if rand < 0.5 {
      let xy = 1.0 - delta_1;
      let val = 2.0 * rand + (1.0 - 2.0 * rand) * xy.powf(eta + 1.0);
      val.powf(mut_pow) - 1.0
    } else {
      let xy = 1.0 - delta_2;
      let val =
        2.0 * (1.0 - rand) + 2.0 * (rand - 0.5) * xy.powf(eta + 1.0);
      1.0 - val.powf(mut_pow)
    };
    *x = (*x + delta_q * (xu - xl)).clamp(xl, xu);
  }
}

/// Variation parameters of [`var_or`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Variation {
  pub cxpb: f64,
  pub mutpb: f64,
  pub eta: f64,
  pub indpb: f64,
}

/// Creates `lambda` offspring. Each slot is crossover with probability
/// `cxpb` (two distinct parents, first child kept), mutation of a clone with
/// probability `mutpb`, or a verbatim copy otherwise. Offspring whose genes
/// changed lose their fitness.
pub fn var_or<R: Rng + ?Sized>(
  population: &[Individual],
  lambda: usize,
  variation: &Variation,
  bounds: &[BoundSpec],
  rng: &mut R,
) -> Vec<Individual> {
  let mut offspring = Vec::with_capacity(lambda);
  if population.is_empty() {
    return offspring;
  }

  for _ in 0..lambda {
    let op_choice = rng.gen::<f64>();
    if op_choice < variation.cxpb && population.len() >= 2 {
      let Some((first, second)) =
        population.choose_multiple(rng, 2).collect_tuple()
      else {
        break;
      };
      let mut child = first.clone();
      let mut other = second.genes().to_vec();
      sbx_bounded(child.genes_mut(), &mut other, bounds, variation.eta, rng);
      offspring.push(child);
    } else if op_choice < variation.cxpb + variation.mutpb {
      let Some(parent) = population.choose(rng) else {
        break;
      };
      let mut child = parent.clone();
      polynomial_bounded(
        child.genes_mut(),
        bounds,
        variation.eta,
        variation.indpb,
        rng,
      );
      offspring.push(child);
    } else if let Some(parent) = population.choose(rng) {
      offspring.push(parent.clone());
    }
  }

  offspring
}

#[cfg(test)]
mod tests {
  use rand::{rngs::StdRng, SeedableRng};

  use super::*;

  fn bounds() -> Vec<BoundSpec> {
    vec![
      BoundSpec {
        index: 0,
        lower: 0.0,
        upper: 10.0,
        integer: true,
      },
      BoundSpec {
        index: 1,
        lower: -1.0,
        upper: 5.0,
        integer: false,
      },
    ]
  }

  fn within(genes: &[f64], bounds: &[BoundSpec]) -> bool {
    genes.len() == bounds.len()
      && genes
        .iter()
        .zip(bounds)
        .all(|(g, b)| (b.lower..=b.upper).contains(g))
  }

  #[test]
  fn test_random_genes() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
      let genes = random_genes(&bounds(), &mut rng);
      assert!(within(&genes, &bounds()));
      assert_eq!(genes[0].fract(), 0.0);
    }
  }

  #[test]
  fn test_operators_stay_in_bounds() {
    let mut rng = StdRng::seed_from_u64(11);
    let bounds = bounds();
    for _ in 0..200 {
      let mut a = random_genes(&bounds, &mut rng);
      let mut b = random_genes(&bounds, &mut rng);
      sbx_bounded(&mut a, &mut b, &bounds, 20.0, &mut rng);
      polynomial_bounded(&mut a, &bounds, 20.0, 1.0, &mut rng);
      assert!(within(&a, &bounds));
      assert!(within(&b, &bounds));
    }
  }

  #[test]
  fn test_var_or_invalidates_changed_offspring() {
    let mut rng = StdRng::seed_from_u64(3);
    let bounds = bounds();
    let population: Vec<_> = (0..4)
      .map(|_| {
        let mut ind = Individual::new(random_genes(&bounds, &mut rng));
        ind.set_fitness(vec![0.0]);
        ind
      })
      .collect();

    let reproduce = Variation {
      cxpb: 0.0,
      mutpb: 0.0,
      eta: 20.0,
      indpb: 1.0,
    };
    let offspring = var_or(&population, 6, &reproduce, &bounds, &mut rng);
    assert_eq!(offspring.len(), 6);
    assert!(offspring.iter().all(Individual::is_valid));

    let mutate = Variation {
      mutpb: 1.0,
      ..reproduce
    };
    let offspring = var_or(&population, 6, &mutate, &bounds, &mut rng);
    assert!(offspring.iter().all(|i| !i.is_valid()));
    assert!(offspring.iter().all(|i| within(i.genes(), &bounds)));
  }
}
