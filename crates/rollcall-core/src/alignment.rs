//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face in an RGB frame to the canonical 112×112 ArcFace
//! position defined by the five InsightFace reference landmarks.

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

const CHANNELS: usize = 3;

/// Least-squares similarity transform (scale, rotation, translation) mapping
/// `src` points onto `dst` points.
///
/// Closed form: with both point sets centred, `a = Σ(u·x + v·y) / Σ(x² + y²)`
/// and `b = Σ(v·x − u·y) / Σ(x² + y²)`; translation follows from the centroids.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let n = src.len() as f32;
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (src_cx, src_cy) = centroid(src);
    let (dst_cx, dst_cy) = centroid(dst);

    let mut norm = 0.0f32;
    let mut num_a = 0.0f32;
    let mut num_b = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (x, y) = (sx - src_cx, sy - src_cy);
        let (u, v) = (dx - dst_cx, dy - dst_cy);
        norm += x * x + y * y;
        num_a += u * x + v * y;
        num_b += v * x - u * y;
    }

    if norm < 1e-12 {
        // Degenerate landmarks (all coincident): translate only.
        return [1.0, 0.0, dst_cx - src_cx, 0.0, 1.0, dst_cy - src_cy];
    }

    let a = num_a / norm;
    let b = num_b / norm;
    let tx = dst_cx - (a * src_cx - b * src_cy);
    let ty = dst_cy - (b * src_cx + a * src_cy);

    [a, -b, tx, b, a, ty]
}

/// Apply a 2×3 similarity warp to an interleaved RGB frame.
///
/// Bilinear sampling; pixels mapped from outside the source are black.
fn warp_affine_rgb(
    frame: &[u8],
    src_width: usize,
    src_height: usize,
    matrix: &[f32; 6],
    out_size: usize,
) -> Vec<u8> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let mut output = vec![0u8; out_size * out_size * CHANNELS];

    // Invert the rotation-scale block [[a, -b], [b, a]]; det = a² + b².
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;

    let in_bounds = |x: i32, y: i32| x >= 0 && y >= 0 && (x as usize) < src_width && (y as usize) < src_height;

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let taps = [
                (x0, y0, (1.0 - fx) * (1.0 - fy)),
                (x0 + 1, y0, fx * (1.0 - fy)),
                (x0, y0 + 1, (1.0 - fx) * fy),
                (x0 + 1, y0 + 1, fx * fy),
            ];

            let out_base = (oy * out_size + ox) * CHANNELS;
            for c in 0..CHANNELS {
                let mut acc = 0.0f32;
                for &(x, y, w) in &taps {
                    if in_bounds(x, y) {
                        acc += frame[(y as usize * src_width + x as usize) * CHANNELS + c] as f32 * w;
                    }
                }
                output[out_base + c] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical 112×112 RGB crop for embedding extraction.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine_rgb(frame, width as usize, height as usize, &matrix, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-3, "{m:?}");
        }
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → a ≈ 0.5, no rotation.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 1e-3, "a = {}", m[0]);
        assert!(m[3].abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_rotated_transform() {
        // Rotate the reference points 90° about the origin; the inverse rotation has b = -1.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!(m[0].abs() < 1e-3, "a = {}", m[0]);
        assert!((m[3] + 1.0).abs() < 1e-3, "b = {}", m[3]);
    }

    #[test]
    fn test_degenerate_landmarks_translate_only() {
        let src = [(10.0, 10.0); 5];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(m[0], 1.0);
        assert_eq!(m[3], 0.0);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = vec![128u8; 640 * 480 * 3];
        let aligned = align_face(&frame, 640, 480, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * 3);
    }

    #[test]
    fn test_landmark_lands_on_reference_position() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h * 3];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // 5x5 red patch at the left eye.
        let (lx, ly) = (src_landmarks[0].0 as usize, src_landmarks[0].1 as usize);
        for y in ly - 2..=ly + 2 {
            for x in lx - 2..=lx + 2 {
                frame[(y * w + x) * 3] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &src_landmarks);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut max_red = 0u8;
        let mut max_green = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                let px = (y * ALIGNED_SIZE + x) * 3;
                max_red = max_red.max(aligned[px]);
                max_green = max_green.max(aligned[px + 1]);
            }
        }
        assert!(max_red > 100, "expected red patch near ({ref_x}, {ref_y}), max={max_red}");
        assert_eq!(max_green, 0, "channels must not bleed into each other");
    }
}
