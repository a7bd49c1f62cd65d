//! Post-compression rate-distortion optimisation (PCRD-opt, Annex J minus
//! the informative appendix, the convex-hull method of Taubman &
//! Marcellin). There is no teacher counterpart: hayro is decode-only, so
//! this module is new code written from the specification, in the same
//! plain-function, no-panics style the rest of the crate uses.
//!
//! A code block's coding passes form a rate-distortion curve: each pass
//! costs more bytes and recovers more distortion. [`convex_hull`] reduces
//! that curve to its concave majorant, a short list of points with
//! strictly decreasing marginal slopes (bytes-per-unit-distortion-gain).
//! [`allocate_layers`] then picks, for each layer's byte budget, a single
//! slope threshold lambda* shared by every code block: a block is
//! truncated wherever its hull's slope first drops below lambda*.

/// One coding-pass boundary of a code block: the byte count and
/// cumulative distortion reduction if truncation happens here. The first
/// point in a block's candidate list is always the zero-pass point
/// `(0, 0.0)`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PassPoint {
    pub(crate) coding_passes: u32,
    pub(crate) cumulative_bytes: u32,
    pub(crate) cumulative_distortion: f64,
}

/// A point kept on the convex hull, tagged with the slope of the segment
/// leading into it from the previous hull point (`f64::INFINITY` for the
/// first point, by convention always worth keeping).
#[derive(Clone, Copy, Debug)]
pub(crate) struct HullPoint {
    pub(crate) coding_passes: u32,
    pub(crate) cumulative_bytes: u32,
    pub(crate) cumulative_distortion: f64,
    pub(crate) slope: f64,
}

fn slope(a: &PassPoint, b: &PassPoint) -> f64 {
    let dx = b.cumulative_bytes as f64 - a.cumulative_bytes as f64;
    if dx <= 0.0 {
        f64::INFINITY
    } else {
        (b.cumulative_distortion - a.cumulative_distortion) / dx
    }
}

/// Reduces a code block's pass-boundary points (assumed sorted by
/// ascending `cumulative_bytes`, the order passes are produced in) to its
/// upper convex hull: repeatedly drop an interior point whenever the
/// slope into it is not strictly greater than the slope out of it.
pub(crate) fn convex_hull(points: &[PassPoint]) -> Vec<HullPoint> {
    let mut hull: Vec<&PassPoint> = Vec::new();

    for point in points {
        while hull.len() >= 2 {
            let a = hull[hull.len() - 2];
            let b = hull[hull.len() - 1];
            if slope(a, b) <= slope(b, point) {
                hull.pop();
            } else {
                break;
            }
        }
        hull.push(point);
    }

    let mut result = Vec::with_capacity(hull.len());
    let mut prev: Option<&PassPoint> = None;
    for point in hull {
        let point_slope = match prev {
            Some(prev_point) => slope(prev_point, point),
            None => f64::INFINITY,
        };
        result.push(HullPoint {
            coding_passes: point.coding_passes,
            cumulative_bytes: point.cumulative_bytes,
            cumulative_distortion: point.cumulative_distortion,
            slope: point_slope,
        });
        prev = Some(point);
    }
    result
}

/// Picks the hull index for one code block at slope threshold `lambda`,
/// never going below `min_idx` (the index selected for the previous
/// layer, enforcing `n_b^L` non-decreasing in `L`).
fn select_index(hull: &[HullPoint], min_idx: usize, lambda: f64) -> usize {
    let mut chosen = min_idx.min(hull.len() - 1);
    for (idx, point) in hull.iter().enumerate().skip(min_idx) {
        if point.slope > lambda {
            chosen = idx;
        } else {
            break;
        }
    }
    chosen
}

fn total_bytes(hulls: &[Vec<HullPoint>], indices: &[usize]) -> u64 {
    indices.iter().zip(hulls).map(|(&idx, hull)| hull[idx].cumulative_bytes as u64).sum()
}

/// Binary-searches a single slope threshold lambda* that brings the
/// combined byte count of every block's selection under `budget`, within
/// `tolerance` (a fraction of `budget`, e.g. 0.005 for 0.5%).
pub(crate) fn allocate_layer(
    hulls: &[Vec<HullPoint>],
    min_indices: &[usize],
    budget: u32,
    tolerance: f64,
) -> Vec<usize> {
    let lambda_max = hulls
        .iter()
        .flat_map(|hull| hull.iter().map(|p| p.slope))
        .filter(|s| s.is_finite() && *s > 0.0)
        .fold(0.0_f64, f64::max);

    let select = |lambda: f64| -> Vec<usize> {
        hulls
            .iter()
            .zip(min_indices)
            .map(|(hull, &min_idx)| select_index(hull, min_idx, lambda))
            .collect()
    };

    let mut lo = 0.0_f64;
    let mut hi = if lambda_max > 0.0 { lambda_max } else { 1.0 };
    let mut best = select(hi);
    let tolerance_bytes = (budget as f64 * tolerance).max(1.0) as u64;

    for _ in 0..32 {
        let mid = (lo + hi) / 2.0;
        let candidate = select(mid);
        let bytes = total_bytes(hulls, &candidate);

        if bytes <= budget as u64 {
            best = candidate;
            hi = mid;
            if budget as u64 - bytes <= tolerance_bytes {
                break;
            }
        } else {
            lo = mid;
        }
    }

    best
}

/// Runs [`allocate_layer`] across every layer in sequence, threading the
/// previous layer's selection in as the next layer's `min_indices` so
/// that every block's truncation point only ever grows. `layer_budgets`
/// entries of `None` take every remaining pass (the common choice for a
/// lossless final layer).
pub(crate) fn allocate_layers(
    hulls: &[Vec<HullPoint>],
    layer_budgets: &[Option<u32>],
    tolerance: f64,
) -> Vec<Vec<usize>> {
    let mut min_indices = vec![0usize; hulls.len()];
    let mut result = Vec::with_capacity(layer_budgets.len());

    for budget in layer_budgets {
        let indices = match budget {
            Some(budget) => allocate_layer(hulls, &min_indices, *budget, tolerance),
            None => hulls.iter().map(|hull| hull.len() - 1).collect(),
        };

        min_indices.clone_from(&indices);
        result.push(indices);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(values: &[(u32, u32, f64)]) -> Vec<PassPoint> {
        values
            .iter()
            .map(|&(coding_passes, cumulative_bytes, cumulative_distortion)| PassPoint {
                coding_passes,
                cumulative_bytes,
                cumulative_distortion,
            })
            .collect()
    }

    #[test]
    fn convex_hull_drops_non_concave_interior_points() {
        // (bytes, distortion): a dominated point at (5, 4.0) between two
        // points whose chord passes above it must be dropped.
        let points = pts(&[(0, 0, 0.0), (1, 5, 4.0), (2, 10, 9.0), (3, 20, 12.0)]);
        let hull = convex_hull(&points);

        assert_eq!(hull.iter().map(|p| p.coding_passes).collect::<Vec<_>>(), vec![0, 2, 3]);
        // Slopes strictly decrease after the sentinel first point.
        assert!(hull[1].slope > hull[2].slope);
    }

    #[test]
    fn allocate_layer_respects_budget_and_monotonic_floor() {
        let hull_a = convex_hull(&pts(&[(0, 0, 0.0), (1, 100, 50.0), (2, 300, 80.0), (3, 800, 95.0)]));
        let hull_b = convex_hull(&pts(&[(0, 0, 0.0), (1, 50, 40.0), (2, 200, 70.0), (3, 600, 90.0)]));
        let hulls = vec![hull_a, hull_b];

        let layer_0 = allocate_layer(&hulls, &[0, 0], 250, 0.02);
        let bytes_0 = total_bytes(&hulls, &layer_0);
        assert!(bytes_0 <= 250, "layer 0 exceeded its budget: {bytes_0}");

        let layer_1 = allocate_layer(&hulls, &layer_0, 900, 0.02);
        let bytes_1 = total_bytes(&hulls, &layer_1);
        assert!(bytes_1 <= 900, "layer 1 exceeded its budget: {bytes_1}");

        for (prev, next) in layer_0.iter().zip(layer_1.iter()) {
            assert!(next >= prev, "truncation point must not shrink between layers");
        }
    }

    #[test]
    fn unbounded_final_layer_takes_every_remaining_pass() {
        let hulls = vec![convex_hull(&pts(&[(0, 0, 0.0), (1, 40, 30.0), (2, 120, 55.0)]))];
        let layers = allocate_layers(&hulls, &[Some(60), None], 0.02);

        assert_eq!(layers[1][0], hulls[0].len() - 1);
    }

    // Deterministic splitmix64, seeded per case so failures reproduce without
    // pulling in a randomness crate the rest of the crate doesn't depend on.
    struct Rng(u64);

    impl Rng {
        fn next_u64(&mut self) -> u64 {
            self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = self.0;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            z ^ (z >> 31)
        }

        fn range(&mut self, lo: u32, hi_inclusive: u32) -> u32 {
            lo + (self.next_u64() % (hi_inclusive - lo + 1) as u64) as u32
        }
    }

    fn random_hull(rng: &mut Rng) -> Vec<HullPoint> {
        let num_passes = rng.range(1, 12);
        let mut bytes = 0u32;
        let mut distortion = 0.0f64;
        let mut points = vec![PassPoint { coding_passes: 0, cumulative_bytes: 0, cumulative_distortion: 0.0 }];
        for n in 1..=num_passes {
            bytes += rng.range(1, 40);
            distortion += rng.range(1, 40) as f64;
            points.push(PassPoint { coding_passes: n, cumulative_bytes: bytes, cumulative_distortion: distortion });
        }
        convex_hull(&points)
    }

    #[test]
    fn layer_truncation_points_never_shrink_across_random_blocks_and_budgets() {
        for case in 0..64u64 {
            let mut rng = Rng(0xC0FFEE ^ case);
            let num_blocks = rng.range(1, 8) as usize;
            let hulls: Vec<_> = (0..num_blocks).map(|_| random_hull(&mut rng)).collect();
            let max_bytes: u32 = hulls.iter().map(|h| h.last().map_or(0, |p| p.cumulative_bytes)).sum();

            let num_layers = rng.range(1, 6) as usize;
            let mut layer_budgets = Vec::with_capacity(num_layers);
            for i in 0..num_layers {
                if i + 1 == num_layers {
                    layer_budgets.push(None);
                } else {
                    layer_budgets.push(Some(rng.range(0, max_bytes.max(1))));
                }
            }

            let layers = allocate_layers(&hulls, &layer_budgets, 0.02);
            for window in layers.windows(2) {
                let (prev, next) = (&window[0], &window[1]);
                for (block, (&p, &n)) in prev.iter().zip(next.iter()).enumerate() {
                    assert!(
                        n >= p,
                        "case {case}: block {block} truncation index shrank from layer to layer ({p} -> {n})"
                    );
                }
            }
        }
    }
}
