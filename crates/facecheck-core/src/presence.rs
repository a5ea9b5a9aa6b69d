//! Face presence detection: "is there a face at all", independent of identity.
//!
//! The intensity image is searched with the SCRFD anchor grid over an input
//! pyramid. Every level contributes raw window hits; overlapping hits are
//! clustered, and a cluster is accepted as a face only when enough windows
//! agree on it and its size clears the configured floor.

use crate::detector::{self, DetectorError, FaceDetect, SCRFD_INPUT_SIZE, SCRFD_MAX_STRIDE};
use crate::types::{BoundingBox, FacePresence, PixelBuffer};
use image::DynamicImage;

/// Smallest pyramid level, in network input pixels.
const PYRAMID_FLOOR: usize = 160;
/// Relative corner tolerance for two windows to count as neighbours.
const GROUP_EPS: f32 = 0.2;
/// Overlap above which two accepted regions are merged.
const REGION_NMS_THRESHOLD: f32 = 0.4;

/// Sensitivity knobs of the presence search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceParams {
    /// Growth of the search window between pyramid levels. Must be > 1.0;
    /// smaller values give more levels (more thorough, slower).
    pub scale_factor: f32,
    /// A region needs more than this many agreeing windows.
    pub min_neighbors: usize,
    /// Minimum region side, in source pixels.
    pub min_size: u32,
}

impl Default for PresenceParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 4,
            min_size: 30,
        }
    }
}

pub struct PresenceDetector {
    params: PresenceParams,
    levels: Vec<usize>,
}

impl PresenceDetector {
    pub fn new(params: PresenceParams) -> Self {
        let levels = pyramid_sizes(params.scale_factor);
        tracing::debug!(?params, ?levels, "presence pyramid");
        Self { params, levels }
    }

    pub fn detect<D: FaceDetect + ?Sized>(
        &self,
        backend: &mut D,
        image: &PixelBuffer,
    ) -> Result<FacePresence, DetectorError> {
        // Single-channel intensity, replicated to the three network planes.
        let intensity = DynamicImage::ImageLuma8(image::imageops::grayscale(image)).to_rgb8();

        let mut windows = Vec::new();
        for &size in &self.levels {
            windows.extend(backend.candidates(&intensity, size)?);
        }
        let window_count = windows.len();

        let groups = group_windows(windows, self.params.min_neighbors);
        let min_size = self.params.min_size as f32;
        let accepted: Vec<BoundingBox> = groups
            .into_iter()
            .filter(|(bbox, _)| bbox.width >= min_size && bbox.height >= min_size)
            .map(|(bbox, _)| bbox)
            .collect();
        let regions = detector::nms(accepted, REGION_NMS_THRESHOLD);

        tracing::debug!(
            width = image.width(),
            height = image.height(),
            levels = self.levels.len(),
            windows = window_count,
            regions = regions.len(),
            "presence check"
        );

        Ok(FacePresence::from_regions(regions))
    }
}

/// Pyramid of square network input sizes: start at the default input size and
/// shrink by `scale_factor` per level, snapping down to the stride multiple.
pub fn pyramid_sizes(scale_factor: f32) -> Vec<usize> {
    let mut sizes: Vec<usize> = Vec::new();
    let mut level = SCRFD_INPUT_SIZE as f32;

    loop {
        let size = (level as usize / SCRFD_MAX_STRIDE) * SCRFD_MAX_STRIDE;
        if size < PYRAMID_FLOOR {
            break;
        }
        if sizes.last() != Some(&size) {
            sizes.push(size);
        }
        if scale_factor.is_nan() || scale_factor <= 1.0 {
            break;
        }
        level /= scale_factor;
    }

    sizes
}

/// Two windows are neighbours when every edge lies within `eps` of the mean side.
fn similar(a: &BoundingBox, b: &BoundingBox) -> bool {
    let delta = GROUP_EPS * (a.width.min(b.width) + a.height.min(b.height)) * 0.5;
    (a.x - b.x).abs() <= delta
        && (a.y - b.y).abs() <= delta
        && (a.x + a.width - b.x - b.width).abs() <= delta
        && (a.y + a.height - b.y - b.height).abs() <= delta
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster windows by the neighbour relation and keep clusters with more than
/// `min_neighbors` members. Each cluster becomes its mean rectangle, carrying
/// the confidence and landmarks of its best member.
fn group_windows(windows: Vec<BoundingBox>, min_neighbors: usize) -> Vec<(BoundingBox, usize)> {
    let n = windows.len();
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&windows[i], &windows[j]) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut clusters: std::collections::BTreeMap<usize, Vec<usize>> = std::collections::BTreeMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut groups: Vec<(BoundingBox, usize)> = clusters
        .into_values()
        .filter(|members| members.len() > min_neighbors)
        .filter_map(|members| {
            let count = members.len() as f32;
            let best = members
                .iter()
                .map(|&i| &windows[i])
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;
            let mean = |f: fn(&BoundingBox) -> f32| members.iter().map(|&i| f(&windows[i])).sum::<f32>() / count;
            let region = BoundingBox {
                x: mean(|b| b.x),
                y: mean(|b| b.y),
                width: mean(|b| b.width),
                height: mean(|b| b.height),
                confidence: best.confidence,
                landmarks: best.landmarks,
            };
            Some((region, members.len()))
        })
        .collect();

    groups.sort_by(|a, b| b.1.cmp(&a.1));
    groups
}
