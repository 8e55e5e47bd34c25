//! # K-Means
//!
//! Deterministic k-means over embedding vectors. Initial centroids are chosen
//! farthest-point first (starting from the first vector), so the same input
//! always yields the same clustering.

const MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Cluster index per input vector
    pub assignments: Vec<usize>,
    pub centroids: Vec<Vec<f32>>,
    pub iterations: usize,
}

/// Cluster `vectors` into `min(k, vectors.len())` groups.
///
/// Returns `None` for empty input, `k == 0`, or vectors of differing
/// dimensions.
pub fn kmeans(vectors: &[Vec<f32>], k: usize) -> Option<KMeansResult> {
    let dims = vectors.first()?.len();
    if k == 0 || dims == 0 || vectors.iter().any(|v| v.len() != dims) {
        return None;
    }
    let k = k.min(vectors.len());

    let mut centroids = initial_centroids(vectors, k);
    let mut assignments = vec![usize::MAX; vectors.len()];
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let mut changed = false;
        for (idx, vector) in vectors.iter().enumerate() {
            let nearest = nearest_centroid(vector, &centroids);
            if assignments[idx] != nearest {
                assignments[idx] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dims]; k];
        let mut counts = vec![0usize; k];
        for (vector, &cluster) in vectors.iter().zip(&assignments) {
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(vector) {
                *sum += value;
            }
        }
        for (cluster, sum) in sums.into_iter().enumerate() {
            // An emptied cluster keeps its previous centroid
            if counts[cluster] > 0 {
                centroids[cluster] = sum
                    .into_iter()
                    .map(|s| s / counts[cluster] as f32)
                    .collect();
            }
        }
    }

    Some(KMeansResult {
        assignments,
        centroids,
        iterations,
    })
}

fn initial_centroids(vectors: &[Vec<f32>], k: usize) -> Vec<Vec<f32>> {
    let mut chosen = vec![0usize];
    while chosen.len() < k {
        let next = vectors
            .iter()
            .enumerate()
            .filter(|(idx, _)| !chosen.contains(idx))
            .map(|(idx, v)| {
                let nearest = chosen
                    .iter()
                    .map(|&c| squared_distance(v, &vectors[c]))
                    .fold(f32::INFINITY, f32::min);
                (idx, nearest)
            })
            .fold(None, |best: Option<(usize, f32)>, (idx, d)| match best {
                Some((_, best_d)) if best_d >= d => best,
                _ => Some((idx, d)),
            });
        match next {
            Some((idx, _)) => chosen.push(idx),
            None => break,
        }
    }
    chosen.into_iter().map(|idx| vectors[idx].clone()).collect()
}

fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(idx, c)| (idx, squared_distance(vector, c)))
        .fold((0, f32::INFINITY), |best, (idx, d)| {
            if d < best.1 {
                (idx, d)
            } else {
                best
            }
        })
        .0
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
