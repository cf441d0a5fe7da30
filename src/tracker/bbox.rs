/// Normalized bounding box with format conversion utilities.
///
/// Boxes live in the unit square of the image and are stored in centre form:
/// - CXCYWH: Centre X, Centre Y, Width, Height
/// - XYXY: Top-Left X, Top-Left Y, Bottom-Right X, Bottom-Right Y
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BBox {
    /// Centre x coordinate
    pub cx: f32,
    /// Centre y coordinate
    pub cy: f32,
    /// Width of the bounding box
    pub w: f32,
    /// Height of the bounding box
    pub h: f32,
}

/// Smallest extent a perturbed or clamped box may shrink to.
pub const MIN_BOX_SIZE: f32 = 1e-4;

const INVERSE_SIGMOID_EPS: f32 = 1e-5;

impl BBox {
    /// Create a new box from centre coordinates and dimensions (CXCYWH format).
    #[inline]
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    /// Create a box from XYXY format (top-left x, top-left y, bottom-right x, bottom-right y).
    #[inline]
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            cx: (x1 + x2) / 2.0,
            cy: (y1 + y2) / 2.0,
            w: x2 - x1,
            h: y2 - y1,
        }
    }

    /// Create a box from the first four values of a row.
    #[inline]
    pub fn from_slice(values: &[f32]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    /// Convert to XYXY format: (x1, y1, x2, y2).
    #[inline]
    pub fn to_xyxy(&self) -> [f32; 4] {
        [
            self.cx - self.w / 2.0,
            self.cy - self.h / 2.0,
            self.cx + self.w / 2.0,
            self.cy + self.h / 2.0,
        ]
    }

    /// Convert to CXCYWH format: (cx, cy, w, h).
    #[inline]
    pub fn to_cxcywh(&self) -> [f32; 4] {
        [self.cx, self.cy, self.w, self.h]
    }

    /// Area of the box.
    #[inline]
    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// True for a degenerate box, such as the zeroed second half of a row
    /// that predicts no division.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= 0.0 || self.h <= 0.0
    }

    /// Intersection and union areas with another box.
    fn intersection_union(&self, other: &BBox) -> (f32, f32) {
        let [ax1, ay1, ax2, ay2] = self.to_xyxy();
        let [bx1, by1, bx2, by2] = other.to_xyxy();

        let inter_w = (ax2.min(bx2) - ax1.max(bx1)).max(0.0);
        let inter_h = (ay2.min(by2) - ay1.max(by1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = (ax2 - ax1) * (ay2 - ay1) + (bx2 - bx1) * (by2 - by1) - inter;
        (inter, union)
    }

    /// Calculate Intersection over Union (IoU) with another bounding box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let (inter, union) = self.intersection_union(other);
        if union > 0.0 { inter / union } else { 0.0 }
    }

    /// Generalized IoU: IoU minus the share of the enclosing box not covered
    /// by the union. Lies in `[-1, 1]` and stays informative for disjoint boxes.
    pub fn giou(&self, other: &BBox) -> f32 {
        let (inter, union) = self.intersection_union(other);
        let iou = if union > 0.0 { inter / union } else { 0.0 };

        let [ax1, ay1, ax2, ay2] = self.to_xyxy();
        let [bx1, by1, bx2, by2] = other.to_xyxy();
        let enclosing = (ax2.max(bx2) - ax1.min(bx1)).max(0.0) * (ay2.max(by2) - ay1.min(by1)).max(0.0);

        if enclosing > 0.0 {
            iou - (enclosing - union) / enclosing
        } else {
            iou
        }
    }

    /// Sum of absolute coordinate differences in CXCYWH form.
    #[inline]
    pub fn l1(&self, other: &BBox) -> f32 {
        (self.cx - other.cx).abs()
            + (self.cy - other.cy).abs()
            + (self.w - other.w).abs()
            + (self.h - other.h).abs()
    }

    /// Clamp the box so that it stays inside the unit square with a minimum size.
    pub fn clamp_unit(&self) -> BBox {
        let [x1, y1, x2, y2] = self.to_xyxy();
        let x1 = x1.clamp(0.0, 1.0 - MIN_BOX_SIZE);
        let y1 = y1.clamp(0.0, 1.0 - MIN_BOX_SIZE);
        let x2 = x2.max(x1 + MIN_BOX_SIZE).min(1.0);
        let y2 = y2.max(y1 + MIN_BOX_SIZE).min(1.0);
        BBox::from_xyxy(x1, y1, x2, y2)
    }

    /// Apply a logit-space delta: `sigmoid(inverse_sigmoid(self) + delta)`.
    ///
    /// This is how every decoder layer refines the incoming reference box.
    pub fn refine(&self, delta: &[f32]) -> BBox {
        let coords = self.to_cxcywh();
        let mut out = [0.0f32; 4];
        for i in 0..4 {
            out[i] = sigmoid(inverse_sigmoid(coords[i]) + delta[i]);
        }
        BBox::from_slice(&out)
    }
}

/// Logistic function.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse of [`sigmoid`] with the input clamped away from 0 and 1.
#[inline]
pub fn inverse_sigmoid(x: f32) -> f32 {
    let x = x.clamp(0.0, 1.0);
    let x1 = x.max(INVERSE_SIGMOID_EPS);
    let x2 = (1.0 - x).max(INVERSE_SIGMOID_EPS);
    (x1 / x2).ln()
}

use ndarray::{Array1, Array2, Axis, Zip};

/// Calculate IoU matrix between two sets of bounding boxes.
///
/// Returns a matrix of shape (M, N) where M is the length of `boxes_a`
/// and N is the length of `boxes_b`.
pub fn iou_batch(boxes_a: &[BBox], boxes_b: &[BBox]) -> Array2<f32> {
    let areas = PairwiseAreas::new(boxes_a, boxes_b);
    Zip::from(&areas.inter)
        .and(&areas.union)
        .map_collect(|&inter, &union| if union > 0.0 { inter / union } else { 0.0 })
}

/// Generalized IoU matrix between two sets of boxes.
pub fn giou_batch(boxes_a: &[BBox], boxes_b: &[BBox]) -> Array2<f32> {
    let areas = PairwiseAreas::new(boxes_a, boxes_b);
    Zip::from(&areas.inter)
        .and(&areas.union)
        .and(&areas.enclosing)
        .map_collect(|&inter, &union, &enclosing| {
            let iou = if union > 0.0 { inter / union } else { 0.0 };
            if enclosing > 0.0 {
                iou - (enclosing - union) / enclosing
            } else {
                iou
            }
        })
}

/// L1 distance matrix between two sets of boxes.
pub fn l1_batch(boxes_a: &[BBox], boxes_b: &[BBox]) -> Array2<f32> {
    let a = columns(boxes_a, BBox::to_cxcywh);
    let b = columns(boxes_b, BBox::to_cxcywh);
    let mut out = Array2::zeros((boxes_a.len(), boxes_b.len()));
    for (ca, cb) in a.iter().zip(&b) {
        out += &outer(ca, cb, |x, y| (x - y).abs());
    }
    out
}

/// Intersection, union and enclosing-box areas of every pair.
struct PairwiseAreas {
    inter: Array2<f32>,
    union: Array2<f32>,
    enclosing: Array2<f32>,
}

impl PairwiseAreas {
    fn new(boxes_a: &[BBox], boxes_b: &[BBox]) -> Self {
        let [ax1, ay1, ax2, ay2] = columns(boxes_a, BBox::to_xyxy);
        let [bx1, by1, bx2, by2] = columns(boxes_b, BBox::to_xyxy);
        let positive = |v: f32| v.max(0.0);

        let inter_w = (outer(&ax2, &bx2, f32::min) - outer(&ax1, &bx1, f32::max)).mapv(positive);
        let inter_h = (outer(&ay2, &by2, f32::min) - outer(&ay1, &by1, f32::max)).mapv(positive);
        let inter = inter_w * inter_h;

        let area_a = (&ax2 - &ax1) * (&ay2 - &ay1);
        let area_b = (&bx2 - &bx1) * (&by2 - &by1);
        let union = outer(&area_a, &area_b, |x, y| x + y) - &inter;

        let enclosing_w = (outer(&ax2, &bx2, f32::max) - outer(&ax1, &bx1, f32::min)).mapv(positive);
        let enclosing_h = (outer(&ay2, &by2, f32::max) - outer(&ay1, &by1, f32::min)).mapv(positive);

        Self {
            inter,
            union,
            enclosing: enclosing_w * enclosing_h,
        }
    }
}

/// The four coordinates of every box as separate columns.
fn columns(boxes: &[BBox], form: impl Fn(&BBox) -> [f32; 4]) -> [Array1<f32>; 4] {
    let rows: Vec<[f32; 4]> = boxes.iter().map(form).collect();
    std::array::from_fn(|k| rows.iter().map(|r| r[k]).collect())
}

/// `f(a[i], b[j])` for every pair, by broadcasting `a` down the rows and
/// `b` across the columns.
fn outer(a: &Array1<f32>, b: &Array1<f32>, f: impl Fn(f32, f32) -> f32) -> Array2<f32> {
    let a = a.view().insert_axis(Axis(1));
    let b = b.view().insert_axis(Axis(0));
    let mut out = Array2::zeros((a.nrows(), b.ncols()));
    Zip::from(&mut out)
        .and_broadcast(&a)
        .and_broadcast(&b)
        .for_each(|o, &x, &y| *o = f(x, y));
    out
}
