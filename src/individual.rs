//! Candidate decision vectors and their lazily computed fitness.

use crate::score::{ParetoDominance, Scores};

/// One candidate: a decision vector plus its fitness, once evaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct Individual {
  genes: Vec<f64>,
  fitness: Option<Scores>,
  /// Crowding distance from the latest NSGA-II ranking.
  pub crowding: f64,
  /// Front number from the latest NSGA-II ranking. Lower is better.
  pub rank: usize,
}

impl Individual {
  pub fn new(genes: Vec<f64>) -> Self {
    Self {
      genes,
      fitness: None,
      crowding: 0.0,
      rank: 0,
    }
  }

  pub fn genes(&self) -> &[f64] {
    &self.genes
  }

  /// Mutable access to the genes. Invalidates the fitness.
  pub fn genes_mut(&mut self) -> &mut Vec<f64> {
    self.fitness = None;
    &mut self.genes
  }

  pub fn fitness(&self) -> Option<&[f64]> {
    self.fitness.as_deref()
  }

  pub fn set_fitness(&mut self, fitness: Scores) {
    self.fitness = Some(fitness);
  }

  /// Whether the fitness was computed since the genes last changed.
  pub fn is_valid(&self) -> bool {
    self.fitness.is_some()
  }

  pub fn invalidate(&mut self) {
    self.fitness = None;
  }

  /// Whether `self` dominates `other`. Unevaluated individuals never
  /// dominate and are never dominated.
  pub fn dominates(&self, other: &Self, weights: &[f64]) -> bool {
    match (self.fitness(), other.fitness()) {
      (Some(a), Some(b)) => a.dominance(b, weights).is_lt(),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_gene_change_invalidates() {
    let mut ind = Individual::new(vec![1.0, 2.0]);
    assert!(!ind.is_valid());
    ind.set_fitness(vec![0.5]);
    assert!(ind.is_valid());
    ind.genes_mut()[0] = 3.0;
    assert!(!ind.is_valid());
    assert_eq!(ind.genes(), &[3.0, 2.0]);
  }

  #[test]
  fn test_dominates_needs_fitness() {
    let mut a = Individual::new(vec![]);
    let mut b = Individual::new(vec![]);
    assert!(!a.dominates(&b, &[1.0]));
    a.set_fitness(vec![2.0]);
    b.set_fitness(vec![1.0]);
    assert!(a.dominates(&b, &[1.0]));
    assert!(!b.dominates(&a, &[1.0]));
  }
}
