//! Merging of raw window hits into detections.
//!
//! Hits whose edges all lie within `eps` of each other (relative to their
//! mean size) are clustered; each cluster becomes its averaged rectangle.
//! Clusters with `min_neighbors` or fewer members are dropped, as are small
//! clusters sitting inside a stronger one.

use std::collections::{BTreeMap, HashMap};

use super::region::Region;

/// Relative edge tolerance used when clustering hits.
pub const GROUP_EPS: f64 = 0.2;

/// Cluster `hits` and return one averaged region per surviving cluster.
///
/// With `min_neighbors == 0` the hits are returned unmerged. Output order
/// follows the first hit of each cluster.
pub fn group_regions(hits: &[Region], min_neighbors: u32, eps: f64) -> Vec<Region> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits.to_vec();
    }

    let labels = partition(hits, eps);
    let cluster_count = labels.iter().copied().max().map_or(0, |max| max + 1);

    let mut sums = vec![[0u64; 4]; cluster_count];
    let mut counts = vec![0u32; cluster_count];
    for (hit, &label) in hits.iter().zip(&labels) {
        let sum = &mut sums[label];
        sum[0] += u64::from(hit.x);
        sum[1] += u64::from(hit.y);
        sum[2] += u64::from(hit.width);
        sum[3] += u64::from(hit.height);
        counts[label] += 1;
    }

    let averaged: Vec<Region> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, &count)| {
            let n = f64::from(count);
            let avg = |value: u64| (value as f64 / n).round() as u32;
            Region::new(avg(sum[0]), avg(sum[1]), avg(sum[2]), avg(sum[3]))
        })
        .collect();

    let strong: Vec<(usize, &Region, u32)> = averaged
        .iter()
        .zip(&counts)
        .enumerate()
        .filter(|(_, (_, count))| **count > min_neighbors)
        .map(|(index, (region, &count))| (index, region, count))
        .collect();

    let mut grouped = Vec::new();
    for &(i, candidate, n1) in &strong {
        let nested = strong.iter().any(|&(j, outer, n2)| {
            if i == j {
                return false;
            }
            let dx = (f64::from(outer.width) * eps).round() as i64;
            let dy = (f64::from(outer.height) * eps).round() as i64;
            let inside = i64::from(candidate.x) >= i64::from(outer.x) - dx
                && i64::from(candidate.y) >= i64::from(outer.y) - dy
                && i64::from(candidate.right()) <= i64::from(outer.right()) + dx
                && i64::from(candidate.bottom()) <= i64::from(outer.bottom()) + dy;
            inside && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push(*candidate);
        }
    }
    grouped
}

fn similar(a: &Region, b: &Region, eps: f64) -> bool {
    let delta = similarity_delta((a.width, a.height), (b.width, b.height), eps);
    let close = |p: u32, q: u32| (f64::from(p) - f64::from(q)).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.right(), b.right())
        && close(a.bottom(), b.bottom())
}

fn similarity_delta(a: (u32, u32), b: (u32, u32), eps: f64) -> f64 {
    eps * f64::from(a.0.min(b.0) + a.1.min(b.1)) * 0.5
}

/// Union-find over the similarity relation. Labels are dense and numbered in
/// order of first appearance.
///
/// Hits are bucketed by size. Two buckets are only compared when their sizes
/// are close enough for any pair to be similar, and within such a pair each
/// hit is only tested against the neighbouring cells of a grid whose cell
/// edge is the pair's tolerance.
fn partition(hits: &[Region], eps: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..hits.len()).collect();

    fn find(parent: &mut [usize], mut node: usize) -> usize {
        while parent[node] != node {
            parent[node] = parent[parent[node]];
            node = parent[node];
        }
        node
    }

    let mut by_size: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
    for (index, hit) in hits.iter().enumerate() {
        by_size
            .entry((hit.width, hit.height))
            .or_default()
            .push(index);
    }
    let buckets: Vec<(&(u32, u32), &Vec<usize>)> = by_size.iter().collect();

    for (first, &(&size_a, members_a)) in buckets.iter().enumerate() {
        for &(&size_b, members_b) in &buckets[first..] {
            let delta = similarity_delta(size_a, size_b, eps);
            // Matching left and right edges bound the width difference.
            if f64::from(size_a.0.abs_diff(size_b.0)) > 2.0 * delta
                || f64::from(size_a.1.abs_diff(size_b.1)) > 2.0 * delta
            {
                continue;
            }
            let cell = delta.ceil().max(1.0) as u32;
            let mut grid: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
            for &j in members_b {
                grid.entry((hits[j].x / cell, hits[j].y / cell))
                    .or_default()
                    .push(j);
            }
            for &i in members_a {
                let (cx, cy) = (hits[i].x / cell, hits[i].y / cell);
                for gx in cx.saturating_sub(1)..=cx.saturating_add(1) {
                    for gy in cy.saturating_sub(1)..=cy.saturating_add(1) {
                        let Some(neighbours) = grid.get(&(gx, gy)) else {
                            continue;
                        };
                        for &j in neighbours {
                            if i == j || !similar(&hits[i], &hits[j], eps) {
                                continue;
                            }
                            let a = find(&mut parent, i);
                            let b = find(&mut parent, j);
                            if a != b {
                                parent[a.max(b)] = a.min(b);
                            }
                        }
                    }
                }
            }
        }
    }

    let mut label_of_root = vec![usize::MAX; hits.len()];
    let mut next = 0;
    (0..hits.len())
        .map(|i| {
            let root = find(&mut parent, i);
            if label_of_root[root] == usize::MAX {
                label_of_root[root] = next;
                next += 1;
            }
            label_of_root[root]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jittered(x: u32, y: u32, size: u32, count: u32) -> Vec<Region> {
        (0..count).map(|i| Region::new(x + i % 2, y + i % 3, size, size)).collect()
    }

    #[test]
    fn clusters_are_averaged() {
        let mut hits = jittered(10, 10, 20, 6);
        hits.extend(jittered(100, 100, 20, 6));
        let grouped = group_regions(&hits, 3, GROUP_EPS);
        assert_eq!(grouped.len(), 2);
        assert!(grouped[0].x.abs_diff(10) <= 1 && grouped[0].y.abs_diff(10) <= 2);
        assert!(grouped[1].x.abs_diff(100) <= 1);
    }

    #[test]
    fn sparse_clusters_are_dropped() {
        let mut hits = jittered(10, 10, 20, 6);
        hits.extend(jittered(200, 200, 20, 2));
        let grouped = group_regions(&hits, 3, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
    }

    #[test]
    fn weak_nested_cluster_is_dropped() {
        let mut hits = jittered(0, 0, 100, 10);
        hits.extend(jittered(40, 40, 10, 4));
        let grouped = group_regions(&hits, 3, GROUP_EPS);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].width, 100);
    }

    #[test]
    fn zero_neighbors_returns_raw_hits() {
        let hits = vec![Region::new(0, 0, 5, 5), Region::new(1, 1, 5, 5)];
        assert_eq!(group_regions(&hits, 0, GROUP_EPS), hits);
    }

    fn all_pairs_labels(hits: &[Region], eps: f64) -> Vec<usize> {
        let mut label: Vec<usize> = (0..hits.len()).collect();
        loop {
            let mut changed = false;
            for i in 0..hits.len() {
                for j in 0..hits.len() {
                    if similar(&hits[i], &hits[j], eps) && label[j] < label[i] {
                        label[i] = label[j];
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        let mut dense = Vec::new();
        label
            .iter()
            .map(|root| match dense.iter().position(|seen| seen == root) {
                Some(index) => index,
                None => {
                    dense.push(*root);
                    dense.len() - 1
                }
            })
            .collect()
    }

    #[test]
    fn grid_partition_matches_all_pairs() {
        let mut state = 0x2545_f491u32;
        let mut next = move |bound: u32| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state % bound
        };
        let sizes = [(24, 8), (26, 9), (29, 10), (32, 11), (48, 16)];
        let hits: Vec<Region> = (0..400)
            .map(|_| {
                let (w, h) = sizes[next(sizes.len() as u32) as usize];
                Region::new(next(120), next(90), w, h)
            })
            .collect();
        assert_eq!(
            partition(&hits, GROUP_EPS),
            all_pairs_labels(&hits, GROUP_EPS)
        );
    }

    #[test]
    fn dense_hits_group_quickly() {
        let mut hits = Vec::new();
        for y in 0..300 {
            for x in 0..300 {
                hits.push(Region::new(x * 2, y * 2, 24, 8));
            }
        }
        let started = std::time::Instant::now();
        let grouped = group_regions(&hits, 5, GROUP_EPS);
        assert!(!grouped.is_empty());
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "grouping {} hits took {:?}",
            hits.len(),
            started.elapsed()
        );
    }
}
