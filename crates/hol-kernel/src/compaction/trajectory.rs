//! Hyperbolic trajectory simplification.
//!
//! Points live in the Poincaré ball model. Distances are computed on the
//! hyperboloid, where geodesics are intersections with planes through the
//! origin and point-to-segment distance has a closed form.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrajectoryError {
    #[error("point {index} lies outside the unit ball (|x| = {norm})")]
    OutsideBall { index: usize, norm: f64 },
    #[error("point {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("point {0} is not finite")]
    NonFinite(usize),
    #[error("epsilon must be finite and non-negative, got {0}")]
    InvalidEpsilon(f64),
}

/// Lift a Poincaré-ball point onto the hyperboloid `-x0² + Σxi² = -1`.
pub fn to_hyperboloid(x: &[f64]) -> Vec<f64> {
    let r2: f64 = x.iter().map(|v| v * v).sum();
    let denom = 1.0 - r2;
    let mut out = Vec::with_capacity(x.len() + 1);
    out.push((1.0 + r2) / denom);
    out.extend(x.iter().map(|v| 2.0 * v / denom));
    out
}

/// Minkowski inner product `-a0 b0 + Σ ai bi`.
pub fn minkowski(a: &[f64], b: &[f64]) -> f64 {
    let spatial: f64 = a.iter().zip(b).skip(1).map(|(x, y)| x * y).sum();
    spatial - a[0] * b[0]
}

fn hyperboloid_distance(a: &[f64], b: &[f64]) -> f64 {
    (-minkowski(a, b)).max(1.0).acosh()
}

/// Geodesic distance between two points of the ball.
pub fn poincare_distance(a: &[f64], b: &[f64]) -> f64 {
    hyperboloid_distance(&to_hyperboloid(a), &to_hyperboloid(b))
}

/// Distance from `p` to the geodesic segment `a`-`b`, all in hyperboloid
/// coordinates.
fn segment_distance_h(p: &[f64], a: &[f64], b: &[f64]) -> f64 {
    let g = -minkowski(a, b);
    let det = 1.0 - g * g;
    if det.abs() < 1e-12 {
        return hyperboloid_distance(p, a);
    }
    let pa = minkowski(p, a);
    let pb = minkowski(p, b);
    // Projection of p onto span(a, b): q = c1 a + c2 b.
    let c1 = (-pa + g * pb) / det;
    let c2 = (-pb + g * pa) / det;
    if c1 >= 0.0 && c2 >= 0.0 {
        let norm = -(c1 * pa + c2 * pb);
        norm.max(1.0).sqrt().acosh()
    } else {
        hyperboloid_distance(p, a).min(hyperboloid_distance(p, b))
    }
}

/// Distance from `p` to the geodesic segment `a`-`b` in the ball.
pub fn segment_distance(p: &[f64], a: &[f64], b: &[f64]) -> f64 {
    segment_distance_h(&to_hyperboloid(p), &to_hyperboloid(a), &to_hyperboloid(b))
}

/// Forbidden-region oracle. Implementations answer which zones a geodesic
/// segment enters.
pub trait ForbiddenZones: Send + Sync {
    fn crossed(&self, a: &[f64], b: &[f64]) -> BTreeSet<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoZones;

impl ForbiddenZones for NoZones {
    fn crossed(&self, _a: &[f64], _b: &[f64]) -> BTreeSet<usize> {
        BTreeSet::new()
    }
}

/// Hyperbolic ball around `center` with geodesic `radius`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub center: Vec<f64>,
    pub radius: f64,
}

/// Built-in oracle: a segment crosses a zone when it passes strictly within
/// the zone's radius of its centre.
#[derive(Debug, Clone, Default)]
pub struct HyperbolicBallZones {
    zones: Vec<(Zone, Vec<f64>)>,
}

impl HyperbolicBallZones {
    pub fn new(zones: impl IntoIterator<Item = Zone>) -> Self {
        Self {
            zones: zones
                .into_iter()
                .map(|zone| {
                    let lifted = to_hyperboloid(&zone.center);
                    (zone, lifted)
                })
                .collect(),
        }
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().map(|(zone, _)| zone)
    }
}

impl ForbiddenZones for HyperbolicBallZones {
    fn crossed(&self, a: &[f64], b: &[f64]) -> BTreeSet<usize> {
        let (ha, hb) = (to_hyperboloid(a), to_hyperboloid(b));
        self.zones
            .iter()
            .enumerate()
            .filter(|(_, (zone, center))| segment_distance_h(center, &ha, &hb) < zone.radius)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of [`compact_trajectory`]: indices into the input that survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simplification {
    pub retained: Vec<usize>,
    /// `(start, end)` chords that would have entered a zone the original
    /// sub-path avoided; every point between them is kept.
    pub rejected_chords: Vec<(usize, usize)>,
}

/// Zones entered by the original path between `start` and `end`.
pub(crate) fn path_zones(segments: &[BTreeSet<usize>], start: usize, end: usize) -> BTreeSet<usize> {
    segments[start..end].iter().flatten().copied().collect()
}

pub(crate) fn segment_zones(points: &[Vec<f64>], zones: &dyn ForbiddenZones) -> Vec<BTreeSet<usize>> {
    points.windows(2).map(|w| zones.crossed(&w[0], &w[1])).collect()
}

pub(crate) fn validate_points(points: &[Vec<f64>]) -> Result<(), TrajectoryError> {
    let expected = points.first().map_or(0, Vec::len);
    for (index, point) in points.iter().enumerate() {
        if point.len() != expected {
            return Err(TrajectoryError::DimensionMismatch {
                index,
                expected,
                found: point.len(),
            });
        }
        if point.iter().any(|v| !v.is_finite()) {
            return Err(TrajectoryError::NonFinite(index));
        }
        let norm = point.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm >= 1.0 {
            return Err(TrajectoryError::OutsideBall { index, norm });
        }
    }
    Ok(())
}

/// Ramer–Douglas–Peucker under the hyperbolic metric. A chord replaces a
/// sub-path only when every dropped point lies within `epsilon` of it and it
/// enters no forbidden zone the sub-path itself stayed out of.
pub fn compact_trajectory(
    points: &[Vec<f64>],
    epsilon: f64,
    zones: &dyn ForbiddenZones,
) -> Result<Simplification, TrajectoryError> {
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(TrajectoryError::InvalidEpsilon(epsilon));
    }
    validate_points(points)?;
    let n = points.len();
    if n <= 2 {
        return Ok(Simplification {
            retained: (0..n).collect(),
            rejected_chords: Vec::new(),
        });
    }

    let lifted: Vec<Vec<f64>> = points.iter().map(|p| to_hyperboloid(p)).collect();
    let segments = segment_zones(points, zones);
    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;
    let mut rejected = Vec::new();

    let mut stack = vec![(0, n - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let (split, farthest) = (start + 1..end)
            .map(|k| (k, segment_distance_h(&lifted[k], &lifted[start], &lifted[end])))
            .fold((start + 1, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if farthest > epsilon {
            keep[split] = true;
            stack.push((split, end));
            stack.push((start, split));
            continue;
        }
        let chord = zones.crossed(&points[start], &points[end]);
        if chord.is_subset(&path_zones(&segments, start, end)) {
            continue;
        }
        keep[start..=end].iter_mut().for_each(|k| *k = true);
        rejected.push((start, end));
    }

    rejected.sort_unstable();
    Ok(Simplification {
        retained: keep
            .iter()
            .enumerate()
            .filter_map(|(i, k)| k.then_some(i))
            .collect(),
        rejected_chords: rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![-0.5 + i as f64 / n as f64, 0.0]).collect()
    }

    #[test]
    fn distance_matches_closed_form_from_origin() {
        // d(0, x) = 2 artanh |x|
        let d = poincare_distance(&[0.0, 0.0], &[0.5, 0.0]);
        assert!((d - 2.0 * 0.5f64.atanh()).abs() < 1e-12);
        assert!(poincare_distance(&[0.3, 0.1], &[0.3, 0.1]) < 1e-6);
    }

    #[test]
    fn segment_distance_uses_endpoints_outside_the_projection() {
        let a = [0.0, 0.0];
        let b = [0.4, 0.0];
        assert!(segment_distance(&[0.2, 0.0], &a, &b) < 1e-6);
        let beyond = segment_distance(&[0.6, 0.0], &a, &b);
        assert!((beyond - poincare_distance(&[0.6, 0.0], &b)).abs() < 1e-9);
        assert!(segment_distance(&[0.2, 0.3], &a, &b) > 0.1);
    }

    #[test]
    fn collinear_points_collapse_to_endpoints() {
        let points = line(20);
        let out = compact_trajectory(&points, 1e-4, &NoZones).unwrap();
        assert_eq!(out.retained, vec![0, 19]);
        assert!(out.rejected_chords.is_empty());
    }

    #[test]
    fn corners_survive() {
        let points = vec![vec![-0.5, 0.0], vec![0.0, 0.0], vec![0.0, 0.5]];
        let out = compact_trajectory(&points, 1e-3, &NoZones).unwrap();
        assert_eq!(out.retained, vec![0, 1, 2]);
    }

    #[test]
    fn chord_through_an_avoided_zone_is_rejected() {
        // The path detours around a zone at the origin; the straight chord
        // would cut through it.
        let points = vec![vec![-0.5, 0.0], vec![-0.2, 0.3], vec![0.2, 0.3], vec![0.5, 0.0]];
        let zones = HyperbolicBallZones::new([Zone {
            center: vec![0.0, 0.0],
            radius: 0.2,
        }]);
        let out = compact_trajectory(&points, 10.0, &zones).unwrap();
        assert_eq!(out.retained, vec![0, 1, 2, 3]);
        assert_eq!(out.rejected_chords, vec![(0, 3)]);

        let loose = compact_trajectory(&points, 10.0, &NoZones).unwrap();
        assert_eq!(loose.retained, vec![0, 3]);
    }

    #[test]
    fn rejects_points_outside_the_ball() {
        let err = compact_trajectory(&[vec![0.0], vec![1.0]], 0.1, &NoZones).unwrap_err();
        assert!(matches!(err, TrajectoryError::OutsideBall { index: 1, .. }));
        assert!(compact_trajectory(&line(3), -1.0, &NoZones).is_err());
    }
}
