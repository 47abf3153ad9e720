//! 强度归一化与区间映射. 两者都不改变几何.

use log::warn;
use ndarray::{Array4, ArrayView3, Axis};

use crate::config::IntensityRange;

/// 单通道的均值和总体标准差 (以 `f64` 累加).
///
/// `nonzero` 为真时只统计非零体素. 没有可统计体素时返回 `None`.
pub fn channel_stats(channel: ArrayView3<'_, f32>, nonzero: bool) -> Option<(f64, f64)> {
    let (mut n, mut sum, mut sq) = (0u64, 0f64, 0f64);
    for v in channel.iter().filter(|v| !nonzero || **v != 0.0) {
        let v = *v as f64;
        n += 1;
        sum += v;
        sq += v * v;
    }
    if n == 0 {
        return None;
    }
    let mean = sum / n as f64;
    let var = (sq / n as f64 - mean * mean).max(0.0);
    Some((mean, var.sqrt()))
}

/// z-score 归一化, 逐通道计算统计量.
///
/// `nonzero` 为真时只使用并只修改非零体素, 背景保持为 0.
/// 标准差为 0 时除数取 1. 通道内没有任何可统计体素时该通道保持不变.
pub fn normalize_intensity(data: &mut Array4<f32>, nonzero: bool) {
    for (c, mut channel) in data.axis_iter_mut(Axis(0)).enumerate() {
        let Some((mean, std)) = channel_stats(channel.view(), nonzero) else {
            warn!("channel {c} has no voxels to normalize, left unchanged");
            continue;
        };
        let std = if std == 0.0 {
            warn!("channel {c} has zero standard deviation, only centering");
            1.0
        } else {
            std
        };
        let (mean, std) = (mean as f32, std as f32);
        let op = |v: &mut f32| {
            if !nonzero || *v != 0.0 {
                *v = (*v - mean) / std;
            }
        };
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                channel.par_map_inplace(op);
            } else {
                channel.map_inplace(op);
            }
        }
    }
}

/// 按 `range` 进行强度区间线性映射.
pub fn scale_intensity(data: &mut Array4<f32>, range: &IntensityRange) {
    let op = |v: &mut f32| *v = range.eval(*v);
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            data.par_map_inplace(op);
        } else {
            data.map_inplace(op);
        }
    }
}
