//! Face alignment via 4-DOF similarity transform.
//!
//! Warps RGB face regions into fixed-size crops: a canonical 112×112 crop
//! from five keypoints for embedding, and a box-centred square crop for
//! landmark prediction.

use crate::types::FaceBox;
use image::{Rgb, RgbImage};

/// Reference keypoints for a 112×112 aligned face.
pub const REFERENCE_KEYPOINTS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// A 2×3 similarity matrix `[a, -b, tx, b, a, ty]`.
pub type Similarity = [f32; 6];

/// Estimate the similarity transform (scale, rotation, translation) taking
/// `src` points onto `dst` points in the least-squares sense.
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    // Each pair (sx, sy) -> (dx, dy) contributes two rows of A·[a, b, tx, ty]ᵀ = B:
    //   sx·a - sy·b + tx = dx
    //   sy·a + sx·b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(&ata, &atb);
    [a, -b, tx, b, a, ty]
}

/// Solve the 4×4 normal equations by Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i * 4..i * 4 + 4]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| {
                m[r1][col]
                    .abs()
                    .partial_cmp(&m[r2][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            // Degenerate keypoints: fall back to identity scale.
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Scale-and-translate transform that maps a square region around `face`,
/// `expand` times its longer side, onto an `out_size` square.
pub fn crop_transform(face: &FaceBox, out_size: u32, expand: f32) -> Similarity {
    let (cx, cy) = face.center();
    let side = face.width.max(face.height) * expand;
    let scale = if side > 0.0 { out_size as f32 / side } else { 1.0 };
    let half = out_size as f32 / 2.0;
    [scale, 0.0, half - scale * cx, 0.0, scale, half - scale * cy]
}

/// Map a point from transformed (output) space back to source image space.
pub fn invert_point(matrix: &Similarity, point: (f32, f32)) -> (f32, f32) {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return point;
    }
    let ia = a / det;
    let ib = b / det;

    let dx = point.0 - tx;
    let dy = point.1 - ty;
    (ia * dx + ib * dy, -ib * dx + ia * dy)
}

/// Warp `image` through `matrix` into an `out_size` square RGB crop.
///
/// Bilinear sampling; pixels mapping outside the source are black.
pub fn warp_affine(image: &RgbImage, matrix: &Similarity, out_size: u32) -> RgbImage {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let mut output = RgbImage::new(out_size, out_size);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < width && y >= 0 && y < height {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = invert_point(matrix, (ox as f32, oy as f32));

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            let mut px = [0u8; 3];
            for c in 0..3 {
                let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                    + tr[c] * fx * (1.0 - fy)
                    + bl[c] * (1.0 - fx) * fy
                    + br[c] * fx * fy;
                px[c] = val.round().clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(ox, oy, Rgb(px));
        }
    }

    output
}

/// Align a face to the canonical 112×112 crop from its five keypoints.
pub fn align_face(image: &RgbImage, keypoints: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(keypoints, &REFERENCE_KEYPOINTS_112);
    warp_affine(image, &matrix, ALIGNED_SIZE)
}
