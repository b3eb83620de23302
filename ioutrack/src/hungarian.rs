/// Hungarian algorithm for optimal detection-to-track assignment
///
/// The float cost matrix is scaled to integers, padded to a square matrix and
/// solved with Kuhn-Munkres. Pairs the caller marks as invalid, and the padding,
/// carry a prohibitive cost and are never reported as assignments.
use ndarray::ArrayView2;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Float costs are multiplied by this before rounding to integers
const COST_SCALE: f64 = 1_000_000.0;

/// Cost of padding cells and invalid pairs
const FORBIDDEN_COST: i64 = 1_000_000_000;

/// Largest magnitude a scaled finite cost may take
const MAX_SCALED_COST: f64 = (FORBIDDEN_COST / 2) as f64;

/// Result of Hungarian assignment algorithm
#[derive(Debug, Clone, Default)]
pub struct AssignmentResult {
    /// Assignments as (detection_idx, track_idx) pairs
    pub assignments: Vec<(usize, usize)>,
    /// Indices of unassigned detections
    pub unassigned_detections: Vec<usize>,
    /// Indices of unassigned tracks
    pub unassigned_tracks: Vec<usize>,
}

impl AssignmentResult {
    fn all_unassigned(num_detections: usize, num_tracks: usize) -> Self {
        Self {
            assignments: Vec::new(),
            unassigned_detections: (0..num_detections).collect(),
            unassigned_tracks: (0..num_tracks).collect(),
        }
    }

    fn from_assignments(
        assignments: Vec<(usize, usize)>,
        num_detections: usize,
        num_tracks: usize,
    ) -> Self {
        let mut used_detections = vec![false; num_detections];
        let mut used_tracks = vec![false; num_tracks];
        for &(d, t) in &assignments {
            used_detections[d] = true;
            used_tracks[t] = true;
        }

        Self {
            assignments,
            unassigned_detections: (0..num_detections)
                .filter(|&i| !used_detections[i])
                .collect(),
            unassigned_tracks: (0..num_tracks).filter(|&j| !used_tracks[j]).collect(),
        }
    }
}

/// Hungarian assignment solver
pub struct HungarianSolver;

impl HungarianSolver {
    /// Solve the minimum-cost assignment problem.
    ///
    /// # Arguments
    /// * `cost_matrix` - `cost_matrix[[i, j]]` is the cost of assigning detection i to track j;
    ///   non-finite entries mark forbidden pairs
    /// * `max_cost` - assignments whose cost exceeds this are rejected after solving
    ///
    /// Costs too large for the fixed integer scale are scaled down together, so
    /// their order is kept up to f32 precision.
    pub fn solve(cost_matrix: ArrayView2<f32>, max_cost: f32) -> AssignmentResult {
        let (num_detections, num_tracks) = cost_matrix.dim();

        if num_detections == 0 || num_tracks == 0 {
            return AssignmentResult::all_unassigned(num_detections, num_tracks);
        }

        let max_abs = cost_matrix
            .iter()
            .filter(|c| c.is_finite())
            .fold(0.0f64, |acc, &c| acc.max(f64::from(c).abs()));
        let scale = if max_abs * COST_SCALE > MAX_SCALED_COST {
            MAX_SCALED_COST / max_abs
        } else {
            COST_SCALE
        };

        let size = num_detections.max(num_tracks);
        let mut weights = Matrix::new(size, size, FORBIDDEN_COST);
        for ((i, j), &cost) in cost_matrix.indexed_iter() {
            if cost.is_finite() {
                weights[(i, j)] = (f64::from(cost) * scale).round() as i64;
            }
        }

        let (_total, row_to_col) = kuhn_munkres_min(&weights);

        let assignments = row_to_col
            .into_iter()
            .enumerate()
            .filter(|&(i, j)| {
                i < num_detections && j < num_tracks && {
                    let cost = cost_matrix[[i, j]];
                    cost.is_finite() && cost <= max_cost
                }
            })
            .collect();

        AssignmentResult::from_assignments(assignments, num_detections, num_tracks)
    }

    /// Solve the assignment problem on an IoU matrix.
    ///
    /// Pairs with a negative IoU are forbidden; pairs with IoU below
    /// `iou_threshold` are left unassigned.
    pub fn solve_iou(iou_matrix: ArrayView2<f32>, iou_threshold: f32) -> AssignmentResult {
        let cost_matrix = iou_matrix.mapv(|iou| if iou < 0.0 { f32::INFINITY } else { 1.0 - iou });

        Self::solve(cost_matrix.view(), 1.0 - iou_threshold)
    }
}
