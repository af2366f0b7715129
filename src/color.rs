// color.rs - Colour math and palette clustering
//
// K-means with farthest-point seeding. Used for surface materials
// in physics data and for colour palettes of semantic annotations.

use ndarray::ArrayView3;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r: r as f32, g: g as f32, b: b as f32 }
    }

    pub fn from_array(c: [u8; 3]) -> Self {
        Self::from_rgb(c[0], c[1], c[2])
    }

    pub fn to_rgb(self) -> [u8; 3] {
        [
            self.r.round().clamp(0.0, 255.0) as u8,
            self.g.round().clamp(0.0, 255.0) as u8,
            self.b.round().clamp(0.0, 255.0) as u8,
        ]
    }

    pub fn dist_sq(self, other: Color) -> f32 {
        let dr = self.r - other.r;
        let dg = self.g - other.g;
        let db = self.b - other.b;
        dr * dr + dg * dg + db * db
    }

    /// Rec. 601 luma in [0, 1]
    pub fn luminance(self) -> f32 {
        ((0.299 * self.r + 0.587 * self.g + 0.114 * self.b) / 255.0).clamp(0.0, 1.0)
    }

    /// HSV saturation in [0, 1]
    pub fn saturation(self) -> f32 {
        let max = self.r.max(self.g).max(self.b);
        let min = self.r.min(self.g).min(self.b);
        if max <= 0.0 { 0.0 } else { ((max - min) / max).clamp(0.0, 1.0) }
    }

    pub fn lerp(self, other: Color, t: f32) -> Color {
        self * (1.0 - t) + other * t
    }
}

impl std::ops::Add for Color {
    type Output = Self;
    fn add(self, o: Self) -> Self {
        Self { r: self.r + o.r, g: self.g + o.g, b: self.b + o.b }
    }
}

impl std::ops::Mul<f32> for Color {
    type Output = Self;
    fn mul(self, s: f32) -> Self {
        Self { r: self.r * s, g: self.g * s, b: self.b * s }
    }
}

/// Every `stride`-th pixel of an (H, W, 3) image, row-major
pub fn sample_pixels(img: ArrayView3<u8>, stride: usize) -> Vec<Color> {
    let (h, w, _) = img.dim();
    let stride = stride.max(1);
    let mut out = Vec::with_capacity((h / stride + 1) * (w / stride + 1));
    for y in (0..h).step_by(stride) {
        for x in (0..w).step_by(stride) {
            out.push(Color::from_rgb(img[[y, x, 0]], img[[y, x, 1]], img[[y, x, 2]]));
        }
    }
    out
}

/// Mean colour, black for an empty slice
pub fn mean(pixels: &[Color]) -> Color {
    if pixels.is_empty() {
        return Color::default();
    }
    let sum = pixels.iter().fold(Color::default(), |acc, &p| acc + p);
    sum * (1.0 / pixels.len() as f32)
}

/// Index of the nearest palette colour
pub fn nearest(c: Color, palette: &[Color]) -> usize {
    palette
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| c.dist_sq(**a).total_cmp(&c.dist_sq(**b)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// K-means clustering. Returns centroids with their member counts,
/// most populous first. Empty clusters are dropped.
pub fn kmeans(pixels: &[Color], k: usize, iters: usize) -> Vec<(Color, usize)> {
    if pixels.is_empty() || k == 0 {
        return vec![];
    }
    let k = k.min(pixels.len());

    // Farthest-point seeding
    let mut centroids = Vec::with_capacity(k);
    centroids.push(pixels[pixels.len() / 2]);

    for _ in 1..k {
        let (mut best_dist, mut best_idx) = (0.0f32, 0);
        for (i, p) in pixels.iter().enumerate() {
            let d = centroids.iter().map(|c| p.dist_sq(*c)).fold(f32::MAX, f32::min);
            if d > best_dist {
                best_dist = d;
                best_idx = i;
            }
        }
        // All remaining pixels coincide with a centroid
        if best_dist == 0.0 {
            break;
        }
        centroids.push(pixels[best_idx]);
    }

    let k = centroids.len();
    let mut counts = vec![0usize; k];
    let mut sums = vec![Color::default(); k];

    for _ in 0..iters.max(1) {
        counts.fill(0);
        sums.fill(Color::default());

        for p in pixels {
            let c = nearest(*p, &centroids);
            counts[c] += 1;
            sums[c] = sums[c] + *p;
        }

        for i in 0..k {
            if counts[i] > 0 {
                centroids[i] = sums[i] * (1.0 / counts[i] as f32);
            }
        }
    }

    let mut clusters: Vec<(Color, usize)> = centroids
        .into_iter()
        .zip(counts)
        .filter(|(_, n)| *n > 0)
        .collect();
    clusters.sort_by(|a, b| b.1.cmp(&a.1));
    clusters
}
