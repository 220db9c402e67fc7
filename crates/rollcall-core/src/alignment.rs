//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a similarity transform (scale, rotation, translation) from the five
//! detected landmarks to the InsightFace reference points, then samples the
//! source image through its inverse.

use crate::types::BoundingBox;
use image::imageops;
use image::{GrayImage, Luma};

/// Output edge length of an aligned crop.
pub const ALIGNED_SIZE: u32 = 112;

/// InsightFace reference landmarks for a 112×112 crop.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`.
    pub fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n < 2 {
            return None;
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n].iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (sx, sy) = mean(src);
        let (dx, dy) = mean(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut energy = 0.0f32;
        for (&(px, py), &(qx, qy)) in src[..n].iter().zip(&dst[..n]) {
            let (px, py) = (px - sx, py - sy);
            let (qx, qy) = (qx - dx, qy - dy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            energy += px * px + py * py;
        }
        if energy <= f32::EPSILON {
            return None;
        }

        let a = dot / energy;
        let b = cross / energy;
        Some(Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Warp `image` into a `size`×`size` crop, sampling bilinearly through the
/// inverse of `to_crop`. Pixels that fall outside the source are black.
pub fn warp(image: &GrayImage, to_crop: &Similarity, size: u32) -> GrayImage {
    let Some(to_source) = to_crop.inverse() else {
        return GrayImage::new(size, size);
    };
    let (w, h) = (image.width() as i64, image.height() as i64);
    let sample = |x: i64, y: i64| -> f32 {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            image.get_pixel(x as u32, y as u32).0[0] as f32
        } else {
            0.0
        }
    };

    GrayImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = to_source.apply((ox as f32, oy as f32));
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
        let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1, y0) * fx;
        let bottom = sample(x0, y0 + 1) * (1.0 - fx) + sample(x0 + 1, y0 + 1) * fx;
        Luma([(top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8])
    })
}

/// Canonical 112×112 crop of the face described by `landmarks`.
pub fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> Option<GrayImage> {
    let transform = Similarity::fit(landmarks, &REFERENCE_LANDMARKS)?;
    Some(warp(image, &transform, ALIGNED_SIZE))
}

/// Face chip for embedding: aligned when landmarks are available, otherwise
/// the box cropped from the image. `None` if the box misses the image.
pub fn face_chip(image: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    if let Some(aligned) = face.landmarks.as_ref().and_then(|lm| align_face(image, lm)) {
        return Some(aligned);
    }
    let (x, y, w, h) = face.clamped_rect(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-2 && t.ty.abs() < 1e-2);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        let src: Vec<(f32, f32)> = REFERENCE_LANDMARKS
            .iter()
            .map(|&(x, y)| (x * 2.0 + 30.0, y * 2.0 - 10.0))
            .collect();
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS).unwrap();
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS.iter()) {
            assert!(close(t.apply(*s), *d, 1e-2));
        }
    }

    #[test]
    fn test_fit_recovers_rotation() {
        // 90° rotation: (x, y) → (−y, x)
        let src = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
        let dst = [(0.0, 0.0), (0.0, 1.0), (-1.0, 0.0)];
        let t = Similarity::fit(&src, &dst).unwrap();
        assert!(t.a.abs() < 1e-5 && (t.b - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_fit_degenerate_points() {
        let src = [(5.0, 5.0); 5];
        assert!(Similarity::fit(&src, &REFERENCE_LANDMARKS).is_none());
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = t.inverse().unwrap();
        let p = (17.0, 42.0);
        assert!(close(inv.apply(t.apply(p)), p, 1e-3));
    }

    #[test]
    fn test_align_output_size() {
        let image = GrayImage::from_pixel(320, 240, Luma([90]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56).0[0], 90);
    }

    #[test]
    fn test_align_moves_landmark_to_reference() {
        let mut image = GrayImage::new(200, 200);
        let landmarks: [(f32, f32); 5] =
            [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(78 + dx, 58 + dy, Luma([255]));
            }
        }

        let aligned = align_face(&image, &landmarks).unwrap();
        let (rx, ry) = (REFERENCE_LANDMARKS[0].0.round() as u32, REFERENCE_LANDMARKS[0].1.round() as u32);
        let brightest = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "left eye patch not near reference, max={brightest}");
    }

    #[test]
    fn test_face_chip_falls_back_to_crop() {
        let image = GrayImage::from_fn(40, 30, |x, _| Luma([x as u8]));
        let face = BoundingBox {
            x: 10.0,
            y: 5.0,
            width: 8.0,
            height: 6.0,
            confidence: 0.9,
            landmarks: None,
        };
        let chip = face_chip(&image, &face).unwrap();
        assert_eq!(chip.dimensions(), (8, 6));
        assert_eq!(chip.get_pixel(0, 0).0[0], 10);
    }

    #[test]
    fn test_face_chip_outside_image() {
        let image = GrayImage::new(20, 20);
        let face = BoundingBox {
            x: 30.0,
            y: 30.0,
            width: 5.0,
            height: 5.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert!(face_chip(&image, &face).is_none());
    }
}
