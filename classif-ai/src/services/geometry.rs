//! Box overlap

use classif_common::db::RegionBox;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeometryError {
    #[error("union of the compared boxes has zero area")]
    DegenerateUnion,
}

/// Intersection over union of two axis-aligned boxes
pub fn iou(a: &RegionBox, b: &RegionBox) -> Result<f64, GeometryError> {
    let [ax1, ay1, ax2, ay2] = a.corners();
    let [bx1, by1, bx2, by2] = b.corners();

    let dx = ax2.min(bx2) - ax1.max(bx1);
    let dy = ay2.min(by2) - ay1.max(by1);
    let intersection = if dx < 0.0 || dy < 0.0 { 0.0 } else { dx * dy };

    let union = a.area() + b.area() - intersection;
    if union.is_nan() || union <= 0.0 {
        return Err(GeometryError::DegenerateUnion);
    }

    Ok(intersection / union)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_overlap() {
        let a = RegionBox::new(0.0, 0.0, 2.0, 2.0);
        let b = RegionBox::new(1.0, 1.0, 2.0, 2.0);
        assert!((iou(&a, &b).unwrap() - 1.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_disjoint_and_touching_boxes() {
        let a = RegionBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(iou(&a, &RegionBox::new(5.0, 5.0, 1.0, 1.0)).unwrap(), 0.0);
        assert_eq!(iou(&a, &RegionBox::new(1.0, 0.0, 1.0, 1.0)).unwrap(), 0.0);
    }

    #[test]
    fn test_identical_boxes() {
        let a = RegionBox::new(3.0, 4.0, 10.0, 2.5);
        assert_eq!(iou(&a, &a).unwrap(), 1.0);
    }

    #[test]
    fn test_zero_area_union_is_an_error() {
        let point = RegionBox::new(1.0, 1.0, 0.0, 0.0);
        assert_eq!(iou(&point, &point), Err(GeometryError::DegenerateUnion));
    }
}
