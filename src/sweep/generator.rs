use tracing::debug;

use crate::core::errors::{GridError, Result};
use crate::sweep::model::{Coordinate, PlanePoint, SweepRange, Task, TaskParameters};

/// `n` evenly spaced samples over `[min, max]`, both endpoints included.
///
/// With `n == 1` the single sample is `min`.
pub fn linspace(min: f64, max: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let step = (max - min) / (n - 1) as f64;
            let mut samples: Vec<f64> = (0..n).map(|i| min + step * i as f64).collect();
            samples[n - 1] = max;
            samples
        }
    }
}

/// Largest task set that can be materialized in one allocation
pub const MAX_GRID_CELLS: usize = isize::MAX as usize / std::mem::size_of::<Task>();

impl SweepRange {
    /// Check the generator preconditions
    pub fn validate(&self) -> Result<()> {
        if !(self.re_min.is_finite() && self.re_max.is_finite()) || self.re_max <= self.re_min {
            return Err(GridError::invalid_range("real", self.re_min, self.re_max));
        }
        if !(self.im_min.is_finite() && self.im_max.is_finite()) || self.im_max <= self.im_min {
            return Err(GridError::invalid_range("imaginary", self.im_min, self.im_max));
        }
        let cells = self.num_points.checked_mul(self.num_points);
        if self.num_points < 1 || cells.map_or(true, |cells| cells > MAX_GRID_CELLS) {
            return Err(GridError::InvalidSize {
                num_points: self.num_points,
            });
        }
        Ok(())
    }
}

/// Enumerate the full task set for a sweep.
///
/// Tasks come out in row-major order: the outer loop walks the imaginary axis
/// (rows), the inner loop the real axis (columns).
pub fn generate_tasks(range: &SweepRange, parameters: TaskParameters) -> Result<Vec<Task>> {
    range.validate()?;

    let re = linspace(range.re_min, range.re_max, range.num_points);
    let im = linspace(range.im_min, range.im_max, range.num_points);

    let tasks: Vec<Task> = im
        .iter()
        .enumerate()
        .flat_map(|(row, &im_value)| {
            re.iter().enumerate().map(move |(col, &re_value)| Task {
                value: PlanePoint::new(re_value, im_value),
                coordinate: Coordinate::new(row, col),
                parameters,
            })
        })
        .collect();

    debug!(
        num_points = range.num_points,
        total = tasks.len(),
        "Generated sweep tasks"
    );
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn range(num_points: usize) -> SweepRange {
        SweepRange {
            re_min: -2.0,
            re_max: 1.0,
            im_min: -1.0,
            im_max: 1.0,
            num_points,
        }
    }

    #[test]
    fn test_linspace_includes_endpoints() {
        assert_eq!(linspace(-2.0, 1.0, 3), vec![-2.0, -0.5, 1.0]);
        assert_eq!(linspace(-1.0, 1.0, 3), vec![-1.0, 0.0, 1.0]);
        assert_eq!(linspace(0.0, 1.0, 1), vec![0.0]);
        let samples = linspace(0.1, 0.7, 7);
        assert_eq!(samples.len(), 7);
        assert_eq!(samples[6], 0.7);
    }

    #[test]
    fn test_three_point_example() {
        let tasks = generate_tasks(&range(3), TaskParameters::default()).unwrap();
        assert_eq!(tasks.len(), 9);
        assert_eq!(tasks[0].coordinate, Coordinate::new(0, 0));
        assert_eq!(tasks[8].coordinate, Coordinate::new(2, 2));

        let center = tasks
            .iter()
            .find(|t| t.coordinate == Coordinate::new(1, 1))
            .unwrap();
        assert_eq!(center.value, PlanePoint::new(-0.5, 0.0));

        // row follows the imaginary axis, col the real axis
        let corner = tasks
            .iter()
            .find(|t| t.coordinate == Coordinate::new(0, 2))
            .unwrap();
        assert_eq!(corner.value, PlanePoint::new(1.0, -1.0));
    }

    #[test]
    fn test_coordinates_cover_grid_exactly_once() {
        for n in [1, 2, 5, 16] {
            let tasks = generate_tasks(&range(n), TaskParameters::default()).unwrap();
            assert_eq!(tasks.len(), n * n);
            let unique: HashSet<Coordinate> = tasks.iter().map(|t| t.coordinate).collect();
            assert_eq!(unique.len(), n * n);
            assert!(unique.iter().all(|c| c.row < n && c.col < n));
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let first = generate_tasks(&range(6), TaskParameters::default()).unwrap();
        let second = generate_tasks(&range(6), TaskParameters::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let mut bad = range(3);
        bad.re_max = bad.re_min;
        assert!(matches!(
            generate_tasks(&bad, TaskParameters::default()),
            Err(GridError::InvalidRange { ref axis, .. }) if axis == "real"
        ));

        let mut bad = range(3);
        bad.im_max = -5.0;
        assert!(matches!(
            generate_tasks(&bad, TaskParameters::default()),
            Err(GridError::InvalidRange { ref axis, .. }) if axis == "imaginary"
        ));

        let mut bad = range(3);
        bad.re_max = f64::NAN;
        assert!(matches!(bad.validate(), Err(GridError::InvalidRange { .. })));

        assert!(matches!(
            generate_tasks(&range(0), TaskParameters::default()),
            Err(GridError::InvalidSize { num_points: 0 })
        ));
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        for num_points in [usize::MAX, usize::MAX / 2, (MAX_GRID_CELLS as f64).sqrt() as usize + 1] {
            assert!(matches!(
                range(num_points).validate(),
                Err(GridError::InvalidSize { num_points: n }) if n == num_points
            ));
        }
        assert!(range(1 << 10).validate().is_ok());
    }
}
