//! Termination conditions of the generational loop.

use crate::individual::Individual;

/// Decides, after every generation, whether the run is over.
///
/// Implemented for closures of type `FnMut(&[Individual]) -> bool`.
///
/// # Examples
/// ```
/// # use dmoga::individual::Individual;
/// // stop as soon as an individual reaches a zero first objective
/// let t = |pop: &[Individual]| {
///   pop.iter().any(|i| i.fitness().is_some_and(|f| f[0] == 0.0))
/// };
/// ```
pub trait Terminator {
  /// If returns `true`, the generation just completed is the last one.
  fn terminate(&mut self, population: &[Individual]) -> bool;
}

impl<F> Terminator for F
where
  F: FnMut(&[Individual]) -> bool,
{
  fn terminate(&mut self, population: &[Individual]) -> bool {
    self(population)
  }
}

/// A `Terminator` that ends the run once a certain number of generations
/// have followed the initial one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GenerationTerminator(pub usize);

impl GenerationTerminator {
  /// Terminator for a run of `ngen` generations in total, counting the
  /// initial population as generation zero.
  pub fn total(ngen: usize) -> Self {
    Self(ngen.saturating_sub(1))
  }
}

impl Terminator for GenerationTerminator {
  fn terminate(&mut self, _: &[Individual]) -> bool {
    match self.0 {
      0 => true,
      _ => {
        self.0 -= 1;
        false
      }
    }
  }
}
