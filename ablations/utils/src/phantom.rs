//! 合成 FLAIR 体模. 用于在没有真实数据的环境下进行可重复的实验.

use lesion_seg::consts::label::{BACKGROUND, LESION};
use lesion_seg::prelude::*;
use ndarray::{Array3, ArrayView3};

/// 球形病灶, 以体素为单位.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sphere {
    /// 球心.
    pub center: [f64; 3],
    /// 半径.
    pub radius: f64,
}

impl Sphere {
    #[inline]
    fn contains(&self, (i, j, k): Idx3d) -> bool {
        let [x, y, z] = self.center;
        let d2 = (i as f64 - x).powi(2) + (j as f64 - y).powi(2) + (k as f64 - z).powi(2);
        d2 <= self.radius * self.radius
    }
}

/// 体模参数.
#[derive(Clone, Debug)]
pub struct Phantom {
    /// 体数据形状.
    pub shape: Shape3d,
    /// 体素间距, 以毫米为单位.
    pub spacing: [f64; 3],
    /// 脑组织 (椭球) 强度.
    pub tissue: f32,
    /// 病灶强度.
    pub lesion: f32,
    /// 确定性伪噪声幅度.
    pub noise: f32,
    /// 病灶列表.
    pub lesions: Vec<Sphere>,
}

impl Phantom {
    /// 形状为 `shape` 的默认体模: 1mm 各向同性, 两个大小不同的病灶.
    pub fn new(shape: Shape3d) -> Self {
        let [a, b, c] = shape.map(|n| n as f64);
        Self {
            shape,
            spacing: [1.0; 3],
            tissue: 90.0,
            lesion: 210.0,
            noise: 6.0,
            lesions: vec![
                Sphere {
                    center: [a * 0.35, b * 0.45, c * 0.5],
                    radius: a.min(b).min(c) * 0.08,
                },
                Sphere {
                    center: [a * 0.62, b * 0.58, c * 0.42],
                    radius: a.min(b).min(c) * 0.05,
                },
            ],
        }
    }

    /// 体素 `pos` 是否在脑组织椭球内?
    fn in_tissue(&self, (i, j, k): Idx3d) -> bool {
        let [a, b, c] = self.shape.map(|n| n as f64);
        let r = |p: usize, n: f64| (p as f64 - (n - 1.0) / 2.0) / (n * 0.42);
        r(i, a).powi(2) + r(j, b).powi(2) + r(k, c).powi(2) <= 1.0
    }

    /// 金标准标签.
    pub fn ground_truth(&self) -> LabelVolume {
        let [a, b, c] = self.shape;
        let data = Array3::from_shape_fn((a, b, c), |pos| {
            if self.in_tissue(pos) && self.lesions.iter().any(|s| s.contains(pos)) {
                LESION
            } else {
                BACKGROUND
            }
        });
        LabelVolume::new(data, self.affine())
    }

    /// 体素到物理坐标的仿射.
    #[inline]
    pub fn affine(&self) -> Affine {
        Affine::from_spacing(self.spacing, [0.0; 3])
    }

    /// 生成强度体数据. 椭球外为 0.
    pub fn image(&self) -> SegResult<NiftiImage> {
        let [a, b, c] = self.shape;
        let data = Array3::from_shape_fn((a, b, c), |pos| {
            if !self.in_tissue(pos) {
                return 0.0;
            }
            let base = if self.lesions.iter().any(|s| s.contains(pos)) {
                self.lesion
            } else {
                self.tissue
            };
            base + self.noise * hash_noise(pos)
        });
        NiftiImage::from_array(data.into_dyn(), self.affine())
    }
}

/// `[-1, 1]` 内的确定性伪随机值.
fn hash_noise((i, j, k): Idx3d) -> f32 {
    let mut h = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (j as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
        ^ (k as u64).wrapping_mul(0x1656_67B1_9E37_79F9);
    h ^= h >> 29;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 32;
    (h % 20001) as f32 / 10000.0 - 1.0
}

/// 两个标签体数据前景的 Dice 系数. 两者都为空时为 1.
pub fn dice(pred: ArrayView3<'_, u8>, truth: ArrayView3<'_, u8>) -> f64 {
    let (mut inter, mut total) = (0usize, 0usize);
    for (p, t) in pred.iter().zip(truth.iter()) {
        let (p, t) = (*p != BACKGROUND, *t != BACKGROUND);
        inter += (p && t) as usize;
        total += p as usize + t as usize;
    }
    if total == 0 {
        1.0
    } else {
        2.0 * inter as f64 / total as f64
    }
}

/// 预测为前景但金标准为背景的体素个数.
pub fn false_positives(pred: ArrayView3<'_, u8>, truth: ArrayView3<'_, u8>) -> usize {
    pred.iter()
        .zip(truth.iter())
        .filter(|(p, t)| **p != BACKGROUND && **t == BACKGROUND)
        .count()
}
