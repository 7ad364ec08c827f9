//! Cluster-based diversity preservation.
//!
//! Fitness vectors are projected onto the hyperplane spanned by the
//! per-objective worst values, clustered with k-means, and summarized by the
//! diversity index `Q`: the sum over clusters of the mean member distance to
//! the cluster centroid. When `Q` collapses below a fraction of its previous
//! value, survivors are drawn round-robin from every cluster instead of by
//! plain NSGA-II truncation.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
  individual::Individual,
  score::{worst_values, Score},
  selection::select_nsga2,
};

const MAX_ITERATIONS: usize = 300;

/// Result of [`project_and_cluster`].
#[derive(Clone, Debug, PartialEq)]
pub struct Clustering {
  /// Diversity index `Q`.
  pub q: f64,
  /// Cluster label of every input point.
  pub labels: Vec<usize>,
}

/// Projects `fitnesses` and clusters them into at most `ncls` clusters.
pub fn project_and_cluster(
  fitnesses: &[&[Score]],
  weights: &[f64],
  ncls: usize,
) -> Clustering {
  if fitnesses.is_empty() {
    return Clustering {
      q: 0.0,
      labels: Vec::new(),
    };
  }

  let ws: Vec<f64> = worst_values(fitnesses, weights)
    .into_iter()
    .map(|w| match 1.0 / w {
      inv if inv.is_finite() => inv,
      _ => 1.0,
    })
    .collect();
  let ws_norm: f64 = ws.iter().map(|w| w * w).sum();
  let projected: Vec<Vec<f64>> = fitnesses
    .iter()
    .map(|f| {
      let scale = (1.0 - dot(&ws, f)) / ws_norm;
      ws.iter().zip(f.iter()).map(|(w, x)| scale * w + x).collect()
    })
    .collect();

  let (labels, centroids) = kmeans(&projected, ncls);

  let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
  for (idx, &label) in labels.iter().enumerate() {
    members.entry(label).or_default().push(idx);
  }
  let q: f64 = members
    .iter()
    .map(|(&label, idxs)| {
      let sum: f64 = idxs
        .iter()
        .map(|&i| distance(&centroids[label], &projected[i]))
        .sum();
      sum / idxs.len() as f64
    })
    .sum();

  Clustering { q, labels }
}

/// Picks `mu` individuals round-robin over clusters: the best ranked member
/// of every cluster first, then the second best of every cluster, and so on.
/// Clusters are ranked internally with NSGA-II.
pub fn diversity_enhanced_selection(
  population: Vec<Individual>,
  labels: &[usize],
  mu: usize,
  weights: &[f64],
) -> Vec<Individual> {
  let mut clusters: BTreeMap<usize, Vec<Individual>> = BTreeMap::new();
  for (ind, &label) in population.into_iter().zip(labels) {
    clusters.entry(label).or_default().push(ind);
  }
  let mut ranked: Vec<std::vec::IntoIter<Individual>> = clusters
    .into_values()
    .map(|cluster| {
      let len = cluster.len();
      select_nsga2(cluster, len, weights).into_iter()
    })
    .collect();

  let mut selected = Vec::with_capacity(mu);
  while selected.len() < mu {
    let before = selected.len();
    for cluster in ranked.iter_mut() {
      if selected.len() == mu {
        break;
      }
      if let Some(ind) = cluster.next() {
        selected.push(ind);
      }
    }
    if selected.len() == before {
      break;
    }
  }
  selected
}

/// Environmental selection with diversity preservation. Remembers the
/// threshold `qbound * Q` between generations.
#[derive(Clone, Debug)]
pub struct DiversityGuard {
  ncls: usize,
  qbound: f64,
  threshold: Option<f64>,
}

impl DiversityGuard {
  pub fn new(ncls: usize, qbound: f64) -> Self {
    Self {
      ncls: ncls.max(1),
      qbound,
      threshold: None,
    }
  }

  /// Guard for populations of `pop_size`. More than `pop_size / 3`
  /// clusters would leave single-member clusters, so `ncls` is clamped.
  pub fn for_population(ncls: usize, qbound: f64, pop_size: usize) -> Self {
    let clamped = ncls.min(pop_size / 3);
    if clamped < ncls {
      warn!(ncls, clamped, "clamping number of clusters");
    }
    Self::new(clamped, qbound)
  }

  pub fn threshold(&self) -> Option<f64> {
    self.threshold
  }

  /// Selects `mu` survivors of `combined`.
  pub fn select(
    &mut self,
    combined: Vec<Individual>,
    mu: usize,
    weights: &[f64],
  ) -> Vec<Individual> {
    let clustering = {
      let fitnesses: Vec<&[Score]> =
        combined.iter().map(|i| i.fitness().unwrap_or(&[])).collect();
      project_and_cluster(&fitnesses, weights, self.ncls)
    };
    debug!(q = clustering.q, labels = ?clustering.labels, "clustered population");

    let collapsed = self.threshold.is_some_and(|t| clustering.q < t);
    let survivors = if collapsed {
      info!(
        q = clustering.q,
        threshold = self.threshold,
        "diversity index below threshold, diversifying population"
      );
      diversity_enhanced_selection(combined, &clustering.labels, mu, weights)
    } else {
      select_nsga2(combined, mu, weights)
    };
    self.threshold = Some(self.qbound * clustering.q);
    survivors
  }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
  a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
  squared_distance(a, b).sqrt()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
  centroids
    .iter()
    .enumerate()
    .map(|(idx, c)| (idx, squared_distance(point, c)))
    .min_by(|a, b| a.1.total_cmp(&b.1))
    .map_or(0, |(idx, _)| idx)
}

/// Lloyd's k-means with k-means++ seeding and a fixed seed, so the same
/// points always yield the same clusters.
fn kmeans(points: &[Vec<f64>], k: usize) -> (Vec<usize>, Vec<Vec<f64>>) {
  let k = k.clamp(1, points.len().max(1));
  let mut rng = StdRng::seed_from_u64(0);
  let mut centroids = seed_centroids(points, k, &mut rng);

  let mut labels: Vec<usize> = vec![usize::MAX; points.len()];
  for _ in 0..MAX_ITERATIONS {
    let next: Vec<usize> =
      points.par_iter().map(|p| nearest(p, &centroids)).collect();
    if next == labels {
      break;
    }
    labels = next;

    for (label, centroid) in centroids.iter_mut().enumerate() {
      let members: Vec<&Vec<f64>> = points
        .iter()
        .zip(&labels)
        .filter(|(_, l)| **l == label)
        .map(|(p, _)| p)
        .collect();
      // an empty cluster keeps its previous centroid
      if members.is_empty() {
        continue;
      }
      for (dim, value) in centroid.iter_mut().enumerate() {
        *value = members.iter().map(|p| p[dim]).sum::<f64>()
          / members.len() as f64;
      }
    }
  }

  (labels, centroids)
}

fn seed_centroids<R: Rng>(
  points: &[Vec<f64>],
  k: usize,
  rng: &mut R,
) -> Vec<Vec<f64>> {
  let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
  if points.is_empty() {
    return centroids;
  }
  centroids.push(points[rng.gen_range(0..points.len())].clone());

  // pick remaining centroids with probability proportional to squared
  // distance to the nearest chosen centroid
  while centroids.len() < k {
    let distances: Vec<f64> = points
      .iter()
      .map(|p| {
        centroids
          .iter()
          .map(|c| squared_distance(p, c))
          .fold(f64::INFINITY, f64::min)
      })
      .collect();
    let total: f64 = distances.iter().sum();
    if total <= 0.0 {
      // fewer distinct points than clusters
      break;
    }
    let mut r = rng.gen::<f64>() * total;
    let mut next_idx = distances
      .iter()
      .rposition(|d| *d > 0.0)
      .unwrap_or(distances.len() - 1);
    for (idx, d) in distances.iter().enumerate() {
      r -= d;
      if r <= 0.0 && *d > 0.0 {
        next_idx = idx;
        break;
      }
    }
    centroids.push(points[next_idx].clone());
  }

  centroids
}

#[cfg(test)]
mod tests {
  use super::*;

  fn evaluated(fitness: &[f64]) -> Individual {
    let mut ind = Individual::new(fitness.to_vec());
    ind.set_fitness(fitness.to_vec());
    ind
  }

  #[test]
  fn test_kmeans_separates_groups() {
    let points = vec![
      vec![0.0, 0.0],
      vec![0.1, 0.0],
      vec![10.0, 10.0],
      vec![10.1, 10.0],
    ];
    let (labels, _) = kmeans(&points, 2);
    assert_eq!(labels[0], labels[1]);
    assert_eq!(labels[2], labels[3]);
    assert_ne!(labels[0], labels[2]);
  }

  #[test]
  fn test_kmeans_more_clusters_than_points() {
    let points = vec![vec![1.0], vec![1.0]];
    let (labels, centroids) = kmeans(&points, 5);
    assert_eq!(labels, [0, 0]);
    assert_eq!(centroids.len(), 1);
  }

  #[test]
  fn test_project_and_cluster_is_deterministic() {
    let fs: Vec<&[f64]> = vec![&[1.0, 9.0], &[2.0, 7.0], &[8.0, 2.0], &[9.0, 1.0]];
    let a = project_and_cluster(&fs, &[-1.0, -1.0], 2);
    let b = project_and_cluster(&fs, &[-1.0, -1.0], 2);
    assert_eq!(a, b);
    assert!(a.q >= 0.0);
    assert_eq!(a.labels.len(), 4);
  }

  #[test]
  fn test_round_robin_over_clusters() {
    let population = vec![
      evaluated(&[1.0, 1.0]),
      evaluated(&[2.0, 2.0]),
      evaluated(&[3.0, 3.0]),
      evaluated(&[10.0, 10.0]),
      evaluated(&[20.0, 0.0]),
    ];
    let labels = [0, 0, 0, 1, 2];
    let selected =
      diversity_enhanced_selection(population, &labels, 4, &[-1.0, -1.0]);
    let fitnesses: Vec<_> = selected.iter().map(|i| i.fitness().unwrap().to_vec()).collect();
    assert_eq!(
      fitnesses,
      vec![
        vec![1.0, 1.0],
        vec![10.0, 10.0],
        vec![20.0, 0.0],
        vec![2.0, 2.0]
      ]
    );
  }

  #[test]
  fn test_round_robin_never_exceeds_population() {
    let population = vec![evaluated(&[1.0, 1.0]), evaluated(&[2.0, 2.0])];
    let selected =
      diversity_enhanced_selection(population, &[0, 1], 5, &[-1.0, -1.0]);
    assert_eq!(selected.len(), 2);
  }

  #[test]
  fn test_clusters_clamped_to_third_of_population() {
    assert_eq!(DiversityGuard::for_population(10, 0.5, 12).ncls, 4);
    assert_eq!(DiversityGuard::for_population(2, 0.5, 12).ncls, 2);
    assert_eq!(DiversityGuard::for_population(3, 0.5, 2).ncls, 1);
  }

  #[derive(Clone, Default)]
  struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

  impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn test_clamping_clusters_is_a_warning() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::WARN)
      .with_ansi(false)
      .with_writer({
        let captured = captured.clone();
        move || captured.clone()
      })
      .finish();
    tracing::subscriber::with_default(subscriber, || {
      DiversityGuard::for_population(2, 0.5, 12);
      DiversityGuard::for_population(10, 0.5, 12);
    });
    let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert_eq!(logs.lines().count(), 1);
    assert!(logs.contains("WARN"));
    assert!(logs.contains("clamping number of clusters"));
  }

  #[test]
  fn test_guard_sets_threshold() {
    let mut guard = DiversityGuard::new(2, 0.5);
    let population: Vec<_> = [[1.0, 9.0], [2.0, 7.0], [8.0, 2.0], [9.0, 1.0]]
      .iter()
      .map(|f| evaluated(f))
      .collect();
    let survivors = guard.select(population, 2, &[-1.0, -1.0]);
    assert_eq!(survivors.len(), 2);
    assert!(guard.threshold().is_some());
  }
}
