use glam::{Mat3, Mat4, Quat, Vec3, Vec3A, Vec4};
use itertools::izip;
use smallvec::SmallVec;

const GAMMA: f32 = 2.2;

/// Splat record as stored on disk: 32 bytes, little endian.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawSplat {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    pub color: [u8; 4],
    /// Packed quaternion in w, x, y, z order, each byte mapped to (b - 128) / 128.
    pub rotation: [u8; 4],
}

impl RawSplat {
    pub const SIZE: usize = 32;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let f = |offset: usize| f32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]]);
        Self {
            position: [f(0), f(4), f(8)],
            scale: [f(12), f(16), f(20)],
            color: [bytes[24], bytes[25], bytes[26], bytes[27]],
            rotation: [bytes[28], bytes[29], bytes[30], bytes[31]],
        }
    }
}

/// Parses consecutive 32-byte records. A trailing partial record is ignored.
pub fn read_raw_splats(bytes: &[u8]) -> Vec<RawSplat> {
    bytes.chunks_exact(RawSplat::SIZE).map(|chunk| {
        let mut record = [0u8; RawSplat::SIZE];
        record.copy_from_slice(chunk);
        RawSplat::from_bytes(&record)
    }).collect()
}

/// Decomposed splat: position, scale, rotation and linear-space color.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplatSplit {
    pub position: Vec3A,
    pub scale: Vec3A,
    pub rotation: Quat,
    pub color: Vec4,
}

impl SplatSplit {
    pub fn opacity(&self) -> f32 { self.color.w }

    pub fn weight(&self) -> f32 { weight(self) }
}

/// Render form: covariance in the linear block of `transform`, mean in its
/// translation column.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Splat {
    pub transform: Mat4,
    pub color: Vec4,
}

impl Splat {
    pub fn new(center: Vec3A, covariance: Mat3, color: Vec4) -> Self {
        let mut transform = Mat4::from_mat3(covariance);
        transform.w_axis = center.extend(1.0);
        Self { transform, color }
    }

    pub fn center(&self) -> Vec3A { Vec3A::from(self.transform.w_axis.truncate()) }

    pub fn covariance(&self) -> Mat3 { Mat3::from_mat4(self.transform) }

    pub fn rgb(&self) -> Vec3A { Vec3A::from(self.color.truncate()) }

    pub fn opacity(&self) -> f32 { self.color.w }

    pub fn volume(&self) -> f32 {
        self.covariance().determinant().max(0.0).sqrt()
    }

    pub fn weight(&self) -> f32 {
        sanitize_weight(self.opacity() * self.volume())
    }
}

pub fn decode(raw: &RawSplat) -> SplatSplit {
    let [w, x, y, z] = raw.rotation.map(|b| (b as f32 - 128.0) / 128.0);
    let rotation = Quat::from_xyzw(x, y, z, w);
    let rotation = if rotation.is_finite() && rotation.length_squared() > 0.0 {
        rotation.normalize()
    } else {
        Quat::IDENTITY
    };

    let [r, g, b, a] = raw.color.map(|c| c as f32 / 255.0);
    SplatSplit {
        position: Vec3A::from_array(raw.position),
        scale: Vec3A::from_array(raw.scale),
        rotation,
        color: Vec4::new(r.powf(GAMMA), g.powf(GAMMA), b.powf(GAMMA), a),
    }
}

pub fn compose(split: &SplatSplit) -> Splat {
    let m = Mat3::from_quat(split.rotation) * Mat3::from_diagonal(Vec3::from(split.scale));
    Splat::new(split.position, m * m.transpose(), split.color)
}

pub fn weight(split: &SplatSplit) -> f32 {
    let scale = split.scale;
    sanitize_weight(split.opacity() * (scale.x * scale.y * scale.z).abs())
}

/// Translates all splats so their mean position sits at the origin.
pub fn recenter(splats: &mut [SplatSplit]) {
    if splats.is_empty() {
        return;
    }
    let mean = splats.iter().fold(Vec3A::ZERO, |acc, s| acc + s.position) / splats.len() as f32;
    for splat in splats.iter_mut() {
        splat.position -= mean;
    }
}

fn sanitize_weight(weight: f32) -> f32 {
    if weight.is_finite() && weight > 0.0 { weight } else { 0.0 }
}

pub(crate) fn normalized_weights(weights: &[f32]) -> SmallVec<[f32; 8]> {
    let mut normalized: SmallVec<[f32; 8]> = weights.iter().map(|&w| sanitize_weight(w)).collect();
    let total = normalized.iter().sum::<f32>();
    if total > 0.0 && total.is_finite() {
        normalized.iter_mut().for_each(|w| *w /= total);
    } else {
        // All-zero weights carry no preference, blend uniformly
        let uniform = 1.0 / normalized.len() as f32;
        normalized.iter_mut().for_each(|w| *w = uniform);
    }
    normalized
}

fn outer(d: Vec3) -> Mat3 {
    Mat3::from_cols(d * d.x, d * d.y, d * d.z)
}

/// Weighted moment-matching merge of any number of splats.
pub fn merge_weighted(splats: &[Splat], weights: &[f32]) -> Splat {
    assert!(!splats.is_empty(), "merge_weighted requires at least one splat");
    assert_eq!(splats.len(), weights.len());
    let weights = normalized_weights(weights);

    let mut center = Vec3A::ZERO;
    let mut color = Vec4::ZERO;
    for (splat, &weight) in izip!(splats, weights.iter()) {
        center = splat.center().mul_add(Vec3A::splat(weight), center);
        color = splat.color.mul_add(Vec4::splat(weight), color);
    }

    let mut covariance = Mat3::ZERO;
    for (splat, &weight) in izip!(splats, weights.iter()) {
        let delta = Vec3::from(splat.center() - center);
        covariance = covariance + (splat.covariance() + outer(delta)) * weight;
    }

    Splat::new(center, covariance, color)
}

pub fn merge(a: &Splat, b: &Splat, wa: f32, wb: f32) -> Splat {
    merge_weighted(&[*a, *b], &[wa, wb])
}

fn trace(m: Mat3) -> f32 {
    m.x_axis.x + m.y_axis.y + m.z_axis.z
}

fn symmetric_kl(a: &Splat, b: &Splat) -> f32 {
    let (cov_a, cov_b) = (a.covariance(), b.covariance());
    let (det_a, det_b) = (cov_a.determinant(), cov_b.determinant());
    if !(det_a > 0.0 && det_b > 0.0 && det_a.is_finite() && det_b.is_finite()) {
        return f32::INFINITY;
    }

    let (inv_a, inv_b) = (cov_a.inverse(), cov_b.inverse());
    if !inv_a.is_finite() || !inv_b.is_finite() {
        return f32::INFINITY;
    }

    let delta = Vec3::from(b.center() - a.center());
    let kl_ab = 0.5 * (trace(inv_b * cov_a) + delta.dot(inv_b * delta) - 3.0 + (det_b / det_a).ln());
    let kl_ba = 0.5 * (trace(inv_a * cov_b) + delta.dot(inv_a * delta) - 3.0 + (det_a / det_b).ln());
    0.5 * (kl_ab + kl_ba)
}

/// Symmetric KL divergence of the two Gaussians plus RGB distance and
/// opacity difference. Singular covariances yield `f32::INFINITY`.
pub fn divergence(a: &Splat, b: &Splat) -> f32 {
    let spatial = symmetric_kl(a, b);
    if !spatial.is_finite() {
        return f32::INFINITY;
    }

    let color = (a.rgb() - b.rgb()).length() + (a.opacity() - b.opacity()).abs();
    let total = spatial + color;
    if total.is_nan() {
        return f32::INFINITY;
    }
    total.max(0.0)
}
