//! Mask helpers shared by the query pool and the criterion.

use ndarray::ArrayView2;

use crate::tracker::bbox::BBox;

/// Tight bounding rectangle of the pixels where `mask > threshold`.
///
/// The rectangle spans pixel edges, so a foreground covering columns
/// `x_min..=x_max` of a `W`-wide mask yields `x1 = x_min / W` and
/// `x2 = (x_max + 1) / W`. Returns `None` for an empty mask.
pub fn mask_to_box(mask: ArrayView2<'_, f32>, threshold: f32) -> Option<BBox> {
    let (height, width) = mask.dim();
    let mut bounds: Option<(usize, usize, usize, usize)> = None;

    for ((y, x), &value) in mask.indexed_iter() {
        if value <= threshold {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }

    bounds.map(|(x0, y0, x1, y1)| {
        BBox::from_xyxy(
            x0 as f32 / width as f32,
            y0 as f32 / height as f32,
            (x1 + 1) as f32 / width as f32,
            (y1 + 1) as f32 / height as f32,
        )
    })
}

/// Number of pixels above `threshold`.
pub fn foreground_area(mask: ArrayView2<'_, f32>, threshold: f32) -> usize {
    mask.iter().filter(|&&v| v > threshold).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn empty_mask_has_no_box() {
        let mask = Array2::<f32>::zeros((8, 8));
        assert!(mask_to_box(mask.view(), 0.5).is_none());
        assert_eq!(foreground_area(mask.view(), 0.5), 0);
    }

    #[test]
    fn single_pixel_box_covers_that_pixel() {
        let mut mask = Array2::<f32>::zeros((4, 8));
        mask[[1, 2]] = 1.0;
        let b = mask_to_box(mask.view(), 0.5).unwrap();
        assert_eq!(b, BBox::from_xyxy(2.0 / 8.0, 1.0 / 4.0, 3.0 / 8.0, 2.0 / 4.0));
    }

    #[test]
    fn logit_threshold_zero_selects_positive_logits() {
        let mut mask = Array2::<f32>::from_elem((5, 5), -3.0);
        mask[[0, 4]] = 2.0;
        mask[[3, 1]] = 0.5;
        let b = mask_to_box(mask.view(), 0.0).unwrap();
        assert_eq!(b, BBox::from_xyxy(1.0 / 5.0, 0.0, 5.0 / 5.0, 4.0 / 5.0));
    }
}
