//! NSGA-II environmental selection: fast non-dominated sorting followed by
//! crowding distance truncation of the last admitted front.

use std::{cmp::Ordering, collections::HashSet};

use rayon::prelude::*;

use crate::{
  individual::Individual,
  score::{ParetoDominance, Score},
};

// index of solution in `scores` slice
type SolutionIndex = usize;
// dominated by each solution solutions' indices
type DominanceList = Vec<SolutionIndex>;
// indices of solutions of a front
type Front = Vec<SolutionIndex>;
// crowding distance of a solution
type CrowdingDistance = f64;

/// Sorts solutions into non-dominated fronts, best first. Stops as soon as
/// the fronts found so far hold at least `k` solutions.
pub fn non_dominated_fronts(
  scores: &[&[Score]],
  weights: &[f64],
  k: usize,
) -> Vec<Front> {
  let n = scores.len();
  if n == 0 || k == 0 {
    return Vec::new();
  }

  // for each solution `p`, collect the solutions it dominates
  let mut dominance_lists: Vec<DominanceList> = (0..n)
    .into_par_iter()
    .map(|p_idx| {
      (0..n)
        .filter(|&q_idx| {
          q_idx != p_idx
            && scores[p_idx].dominance(scores[q_idx], weights) == Ordering::Less
        })
        .collect()
    })
    .collect();
  // and count how many solutions dominate each solution
  let mut dominance_counters = vec![0usize; n];
  for q_idx in dominance_lists.iter().flatten() {
    dominance_counters[*q_idx] += 1;
  }

  let mut fronts: Vec<Front> = Vec::new();
  let mut current: Front =
    (0..n).filter(|&idx| dominance_counters[idx] == 0).collect();
  let mut collected = 0;
  // until we collect enough solutions...
  while !current.is_empty() {
    collected += current.len();
    let mut next = Vec::new();
    // for each solution `p` in current front...
    for p_idx in current.iter() {
      // for each solution `q` dominated by `p`...
      for q_idx in std::mem::take(&mut dominance_lists[*p_idx]) {
        dominance_counters[q_idx] -= 1;
        // if no more solutions dominate `q`, it belongs to the next front
        if dominance_counters[q_idx] == 0 {
          next.push(q_idx);
        }
      }
    }
    fronts.push(current);
    if collected >= k {
      break;
    }
    current = next;
  }

  fronts
}

/// Crowding distance of each member of `front`, in `front` order. Boundary
/// solutions of every objective get an infinite distance.
pub fn crowding_distances(
  scores: &[&[Score]],
  front: &[SolutionIndex],
) -> Vec<CrowdingDistance> {
  let len = front.len();
  let mut distances = vec![0.0; len];
  if len == 0 {
    return distances;
  }
  let objectives = scores[front[0]].len();

  // positions into `front`, sorted per objective
  let mut order: Vec<usize> = (0..len).collect();
  for o_idx in 0..objectives {
    let value = |pos: usize| scores[front[pos]][o_idx];
    order.sort_by(|&a, &b| value(a).total_cmp(&value(b)));

    let (first, last) = (order[0], order[len - 1]);
    distances[first] = f64::INFINITY;
    distances[last] = f64::INFINITY;
    let span = value(last) - value(first);
    if span == 0.0 {
      continue;
    }
    let norm = span * objectives as f64;
    for w in order.windows(3) {
      distances[w[1]] += (value(w[2]) - value(w[0])) / norm;
    }
  }

  distances
}

/// Selects `k` individuals with NSGA-II: whole fronts while they fit, then the
/// least crowded members of the first front that does not. Survivors carry
/// their front number and crowding distance, in selection order.
pub fn select_nsga2(
  population: Vec<Individual>,
  k: usize,
  weights: &[f64],
) -> Vec<Individual> {
  let n = population.len();
  let k = k.min(n);

  let (chosen, ranks, crowding) = {
    let scores: Vec<&[Score]> = population
      .iter()
      .map(|ind| ind.fitness().unwrap_or(&[]))
      .collect();
    let fronts = non_dominated_fronts(&scores, weights, k);

    let mut ranks = vec![usize::MAX; n];
    let mut crowding = vec![0.0; n];
    for (rank, front) in fronts.iter().enumerate() {
      let distances = crowding_distances(&scores, front);
      for (&idx, distance) in front.iter().zip(distances) {
        ranks[idx] = rank;
        crowding[idx] = distance;
      }
    }

    let mut chosen: Vec<SolutionIndex> = Vec::with_capacity(k);
    for front in fronts {
      if chosen.len() + front.len() <= k {
        chosen.extend(front);
      } else {
        let mut last = front;
        // stable, so ties keep their front order
        last.sort_by(|&a, &b| crowding[b].total_cmp(&crowding[a]));
        last.truncate(k - chosen.len());
        chosen.append(&mut last);
        break;
      }
    }
    (chosen, ranks, crowding)
  };

  debug_assert_eq!(
    chosen.len(),
    HashSet::<usize>::from_iter(chosen.iter().cloned()).len(),
    "chosen must have only unique indices"
  );

  let mut slots: Vec<Option<Individual>> =
    population.into_iter().map(Some).collect();
  let selected: Vec<Individual> = chosen
    .into_iter()
    .filter_map(|idx| {
      slots[idx].take().map(|mut ind| {
        ind.rank = ranks[idx];
        ind.crowding = crowding[idx];
        ind
      })
    })
    .collect();

  debug_assert_eq!(selected.len(), k, "selection must return `k` solutions");
  selected
}
