//! Archive of the best individuals found during a run.

use crate::individual::Individual;

/// Size of the archive when there is only one objective.
pub const HALL_OF_FAME_SIZE: usize = 10;

/// Historically best individuals. With several objectives this is the
/// unbounded non-dominated set; with one objective it keeps the
/// [`HALL_OF_FAME_SIZE`] best.
#[derive(Clone, Debug)]
pub struct ParetoArchive {
  weights: Vec<f64>,
  capacity: Option<usize>,
  members: Vec<Individual>,
}

impl ParetoArchive {
  pub fn new(weights: Vec<f64>) -> Self {
    let capacity = (weights.len() <= 1).then_some(HALL_OF_FAME_SIZE);
    Self {
      weights,
      capacity,
      members: Vec::new(),
    }
  }

  pub fn members(&self) -> &[Individual] {
    &self.members
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  /// Merges evaluated individuals of `population` into the archive.
  pub fn update(&mut self, population: &[Individual]) {
    for ind in population.iter().filter(|i| i.is_valid()) {
      match self.capacity {
        Some(capacity) => self.update_ranked(ind, capacity),
        None => self.update_front(ind),
      }
    }
  }

  fn update_front(&mut self, ind: &Individual) {
    let weights = &self.weights;
    if self
      .members
      .iter()
      .any(|m| m.dominates(ind, weights) || is_twin(m, ind))
    {
      return;
    }
    self.members.retain(|m| !ind.dominates(m, weights));
    self.members.push(ind.clone());
  }

  fn update_ranked(&mut self, ind: &Individual, capacity: usize) {
    if self.members.iter().any(|m| is_twin(m, ind)) {
      return;
    }
    let key = |i: &Individual| weighted(i, &self.weights);
    let score = key(ind);
    let pos = self.members.partition_point(|m| key(m) >= score);
    if pos >= capacity {
      return;
    }
    self.members.insert(pos, ind.clone());
    self.members.truncate(capacity);
  }
}

fn weighted(ind: &Individual, weights: &[f64]) -> f64 {
  ind
    .fitness()
    .map(|f| f.iter().zip(weights).map(|(f, w)| f * w).sum())
    .unwrap_or(f64::NEG_INFINITY)
}

fn is_twin(a: &Individual, b: &Individual) -> bool {
  a.fitness() == b.fitness() && a.genes() == b.genes()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn evaluated(genes: &[f64], fitness: &[f64]) -> Individual {
    let mut ind = Individual::new(genes.to_vec());
    ind.set_fitness(fitness.to_vec());
    ind
  }

  #[test]
  fn test_front_prunes_dominated() {
    let mut archive = ParetoArchive::new(vec![-1.0, -1.0]);
    archive.update(&[
      evaluated(&[0.0], &[3.0, 3.0]),
      evaluated(&[1.0], &[1.0, 4.0]),
    ]);
    assert_eq!(archive.len(), 2);
    archive.update(&[
      evaluated(&[2.0], &[2.0, 2.0]),
      evaluated(&[3.0], &[5.0, 5.0]),
      evaluated(&[2.0], &[2.0, 2.0]),
      Individual::new(vec![9.0]),
    ]);
    let fitnesses: Vec<_> = archive.members().iter().filter_map(|m| m.fitness()).collect();
    assert_eq!(fitnesses, vec![&[1.0, 4.0][..], &[2.0, 2.0][..]]);
  }

  #[test]
  fn test_single_objective_keeps_ten_best() {
    let mut archive = ParetoArchive::new(vec![1.0]);
    let population: Vec<_> = (0..15)
      .map(|i| evaluated(&[i as f64], &[i as f64]))
      .collect();
    archive.update(&population);
    archive.update(&population);
    assert_eq!(archive.len(), HALL_OF_FAME_SIZE);
    assert_eq!(archive.members()[0].fitness(), Some(&[14.0][..]));
    assert_eq!(archive.members()[9].fitness(), Some(&[5.0][..]));
  }
}
