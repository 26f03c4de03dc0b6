//! Dispatch sizing math
//!
//! Pure helpers shared by the pipeline factories. Element counts are
//! rounded up to the subgroup width, distributed over grid axes, and
//! checked against device limits here, before any pipeline is compiled.

use crate::context::DeviceLimits;
use crate::error::NnError;

/// Round `n` up to the next multiple of `alignment`.
pub fn align_up(n: u32, alignment: u32) -> u32 {
    debug_assert!(alignment > 0);
    n.div_ceil(alignment) * alignment
}

pub fn ceil_div(n: u32, d: u32) -> u32 {
    debug_assert!(d > 0);
    n.div_ceil(d)
}

pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// One-dimensional fit: subgroup-wide workgroups on axis 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearFit {
    /// Local workgroup width (the subgroup size)
    pub local_size: u32,
    /// Workgroup count on axis 0
    pub group_count: u32,
}

/// Fit `elements` invocations into subgroup-wide workgroups on axis 0.
pub fn linear_fit(elements: u32, limits: &DeviceLimits) -> Result<LinearFit, NnError> {
    let local_size = limits.subgroup_size;
    let group_count = ceil_div(elements, local_size);
    if group_count > limits.max_group_count[0] || local_size > limits.max_group_size[0] {
        return Err(NnError::TooLargeData);
    }
    Ok(LinearFit {
        local_size,
        group_count,
    })
}

/// Split `groups` workgroups over axes 0 and 1.
///
/// Axis 0 takes the gcd against its count limit so the split is exact; the
/// remainder lands on axis 1.
pub fn plane_grid(groups: u32, limits: &DeviceLimits) -> Result<[u32; 3], NnError> {
    if groups <= limits.max_group_count[0] {
        return Ok([groups, 1, 1]);
    }
    let width = gcd(groups, limits.max_group_count[0]);
    let height = groups / width;
    if height > limits.max_group_count[1] {
        return Err(NnError::TooLargeData);
    }
    Ok([width, height, 1])
}

/// Per-item workgroups on axis 0, batch on axis 2.
pub fn batched_grid(
    per_item_groups: u32,
    batch: u32,
    limits: &DeviceLimits,
) -> Result<[u32; 3], NnError> {
    if per_item_groups > limits.max_group_count[0] {
        return Err(NnError::TooLargeData);
    }
    if batch > limits.max_group_count[2] {
        return Err(NnError::TooLargeData);
    }
    Ok([per_item_groups, 1, batch])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            subgroup_size: 32,
            max_group_count: [65535, 65535, 65535],
            max_group_size: [1024, 1024, 64],
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 13), 1);
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(5, 0), 5);
    }

    #[test]
    fn test_linear_fit_covers_all_elements() {
        let limits = limits();
        for elements in [1u32, 31, 32, 33, 100, 1024, 100_000] {
            let fit = linear_fit(elements, &limits).unwrap();
            let covered = fit.local_size * fit.group_count;
            assert!(covered >= elements, "elements={}", elements);
            // Excess is bounded by one subgroup
            assert!(covered - elements < limits.subgroup_size, "elements={}", elements);
        }
    }

    #[test]
    fn test_linear_fit_rejects_oversize() {
        let mut limits = limits();
        limits.max_group_count[0] = 4;
        assert!(matches!(
            linear_fit(4 * 32 + 1, &limits),
            Err(NnError::TooLargeData)
        ));
        assert!(linear_fit(4 * 32, &limits).is_ok());
    }

    #[test]
    fn test_plane_grid_exact_product() {
        let mut limits = limits();
        limits.max_group_count[0] = 1024;
        for groups in [1u32, 1000, 1024, 2048, 1 << 20] {
            let grid = plane_grid(groups, &limits).unwrap();
            assert_eq!(grid[0] * grid[1], groups);
            assert!(grid[0] <= limits.max_group_count[0]);
            assert_eq!(grid[2], 1);
        }
    }

    #[test]
    fn test_plane_grid_rejects_unsplittable() {
        let mut limits = limits();
        limits.max_group_count[0] = 8;
        limits.max_group_count[1] = 8;
        // 65 shares no factor with 8, so the whole count lands on axis 1
        assert!(matches!(plane_grid(65, &limits), Err(NnError::TooLargeData)));
    }

    #[test]
    fn test_batched_grid_limits() {
        let mut limits = limits();
        limits.max_group_count[2] = 16;
        assert_eq!(batched_grid(4, 16, &limits).unwrap(), [4, 1, 16]);
        assert!(matches!(
            batched_grid(4, 17, &limits),
            Err(NnError::TooLargeData)
        ));
    }
}
