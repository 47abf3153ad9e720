//! 由仿射矩阵驱动的重采样.
//!
//! 输出体素 `o` 对应的输入 (实数) 体素坐标为 `inv(A_in) * A_out * o`.
//! 越界坐标按边界体素取值 (border clamp).

use ndarray::{Array3, Array4, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};

use crate::data::{Affine, SpatialMeta};
use crate::{SegError, SegResult, Shape3d, Stage};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 对三维数组的每个 `i` 平面实施 `op(i, plane)`. 开启 `rayon` 特性时并行执行.
///
/// 每个平面互不重叠, 因此串行与并行结果完全一致.
pub(crate) fn for_each_plane_mut<T, F>(mut out: ArrayViewMut3<'_, T>, op: F)
where
    T: Send + Sync,
    F: Fn(usize, ArrayViewMut2<'_, T>) + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(i, plane)| op(i, plane));
        } else {
            out.axis_iter_mut(Axis(0))
                .enumerate()
                .for_each(|(i, plane)| op(i, plane));
        }
    }
}

/// 计算把 `meta` 重采样到体素间距 `target` 后的网格.
///
/// 新仿射保持原方向, 每列缩放为目标间距. 新形状使输入网格的八个角点
/// (体素中心) 全部落在输出网格内, 即 `round(跨度 + 1)`. 新原点为输入角点中
/// 在输出体素坐标下最小的那一个.
pub fn spacing_meta(meta: &SpatialMeta, target: [f64; 3]) -> SegResult<SpatialMeta> {
    let zoomed = meta.affine.with_spacing(target);
    let mat = zoomed
        .linear()
        .try_inverse()
        .map(|inv| inv * meta.affine.linear())
        .ok_or_else(|| {
            SegError::geometry(Stage::Spacing, format!("singular affine {:?}", meta.affine))
        })?;

    let [ni, nj, nk] = meta.shape;
    let last = |n: usize| n.saturating_sub(1) as f64;
    let corners: Vec<[f64; 3]> = itertools::iproduct!([0.0, last(ni)], [0.0, last(nj)], [0.0, last(nk)])
        .map(|(i, j, k)| [i, j, k])
        .collect();
    let projected: Vec<[f64; 3]> = corners
        .iter()
        .map(|c| {
            let v = mat * nalgebra::Vector3::new(c[0], c[1], c[2]);
            [v[0], v[1], v[2]]
        })
        .collect();

    let mut shape = [1usize; 3];
    for (d, s) in shape.iter_mut().enumerate() {
        let (lo, hi) = projected
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p[d]), hi.max(p[d])));
        *s = ((hi - lo) + 1.0).round().max(1.0) as usize;
    }

    let origin = projected
        .iter()
        .position(|p| {
            projected
                .iter()
                .all(|q| (0..3).all(|d| q[d] - p[d] >= -1e-6 * (1.0 + p[d].abs())))
        })
        .unwrap_or(0);
    let origin = meta.affine.apply(corners[origin]);

    Ok(SpatialMeta::new(zoomed.with_translation(origin), shape))
}

/// 输出体素索引到输入体素索引的仿射.
fn index_map(src: &SpatialMeta, dst: &SpatialMeta, stage: Stage) -> SegResult<Affine> {
    let inv = src.affine.inverse().ok_or_else(|| {
        SegError::geometry(stage, format!("singular source affine {:?}", src.affine))
    })?;
    Ok(inv * dst.affine)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// 一维线性插值的两个邻点和权重. 坐标先被截断到 `[0, n - 1]`.
#[inline]
fn linear_neighbors(p: f64, n: usize) -> (usize, usize, f32) {
    let p = num::clamp(p, 0.0, n.saturating_sub(1) as f64);
    let i0 = (p.floor() as usize).min(n.saturating_sub(2));
    let i1 = (i0 + 1).min(n - 1);
    (i0, i1, (p - i0 as f64) as f32)
}

/// 最近邻. 坐标先被截断到 `[0, n - 1]`.
#[inline]
fn nearest(p: f64, n: usize) -> usize {
    num::clamp(p.round(), 0.0, n.saturating_sub(1) as f64) as usize
}

/// 三线性插值采样一个输入通道.
fn sample_trilinear(src: &ArrayView3<'_, f32>, [x, y, z]: [f64; 3]) -> f32 {
    let (ni, nj, nk) = src.dim();
    let (i0, i1, ti) = linear_neighbors(x, ni);
    let (j0, j1, tj) = linear_neighbors(y, nj);
    let (k0, k1, tk) = linear_neighbors(z, nk);

    let c00 = lerp(src[(i0, j0, k0)], src[(i1, j0, k0)], ti);
    let c10 = lerp(src[(i0, j1, k0)], src[(i1, j1, k0)], ti);
    let c01 = lerp(src[(i0, j0, k1)], src[(i1, j0, k1)], ti);
    let c11 = lerp(src[(i0, j1, k1)], src[(i1, j1, k1)], ti);
    let c0 = lerp(c00, c10, tj);
    let c1 = lerp(c01, c11, tj);
    lerp(c0, c1, tk)
}

/// 将通道优先的强度数据从 `src` 网格三线性重采样到 `dst` 网格.
pub fn resample_trilinear(
    data: &Array4<f32>,
    src: &SpatialMeta,
    dst: &SpatialMeta,
) -> SegResult<Array4<f32>> {
    let map = index_map(src, dst, Stage::Spacing)?;
    let [ni, nj, nk] = dst.shape;
    let mut out = Array4::<f32>::zeros((data.len_of(Axis(0)), ni, nj, nk));

    for (input, output) in data.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
        for_each_plane_mut(output, |i, mut plane| {
            for ((j, k), v) in plane.indexed_iter_mut() {
                *v = sample_trilinear(&input, map.apply([i as f64, j as f64, k as f64]));
            }
        });
    }
    Ok(out)
}

/// 将离散标签从 `src` 网格最近邻重采样到 `dst` 网格.
///
/// 标签只能使用最近邻, 否则会产生不存在的中间类别.
pub fn resample_nearest<T>(
    data: ArrayView3<'_, T>,
    src: &SpatialMeta,
    dst: &SpatialMeta,
) -> SegResult<Array3<T>>
where
    T: Copy + Default + Send + Sync,
{
    let map = index_map(src, dst, Stage::Restore)?;
    let (si, sj, sk) = data.dim();
    let [ni, nj, nk]: Shape3d = dst.shape;
    let mut out = Array3::<T>::default((ni, nj, nk));

    for_each_plane_mut(out.view_mut(), |i, mut plane| {
        for ((j, k), v) in plane.indexed_iter_mut() {
            let [x, y, z] = map.apply([i as f64, j as f64, k as f64]);
            *v = data[(nearest(x, si), nearest(y, sj), nearest(z, sk))];
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_spacing_meta_shape() {
        let meta = SpatialMeta::new(Affine::identity(), [128, 128, 128]);
        let out = spacing_meta(&meta, [0.7; 3]).unwrap();
        assert_eq!(out.shape, [182, 182, 182]);
        assert_eq!(out.affine.translation(), [0.0; 3]);
        assert!(out.affine.spacing().iter().all(|s| (s - 0.7).abs() < 1e-9));

        // 同间距时网格不变.
        let meta = SpatialMeta::new(Affine::from_spacing([0.7; 3], [1.0, 2.0, 3.0]), [10, 11, 12]);
        let out = spacing_meta(&meta, [0.7; 3]).unwrap();
        assert!(out.same_grid(&meta));
    }

    #[test]
    fn test_spacing_meta_flipped_origin() {
        // 第一轴反向时方向保持不变, 原点仍为体素 (0, 0, 0).
        let meta = SpatialMeta::new(Affine::from_spacing([-1.0, 1.0, 1.0], [9.0, 0.0, 0.0]), [10, 4, 4]);
        let out = spacing_meta(&meta, [0.5, 1.0, 1.0]).unwrap();
        assert_eq!(out.shape, [19, 4, 4]);
        assert_eq!(out.affine.apply([0.0; 3]), [9.0, 0.0, 0.0]);
        assert_eq!(out.affine.apply([18.0, 0.0, 0.0]), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_trilinear_uniform_and_linear() {
        let src = SpatialMeta::new(Affine::identity(), [8, 8, 8]);
        let dst = spacing_meta(&src, [0.5; 3]).unwrap();

        let uniform = Array4::<f32>::from_elem((1, 8, 8, 8), 100.0);
        let out = resample_trilinear(&uniform, &src, &dst).unwrap();
        assert_eq!(out.shape(), &[1, 15, 15, 15]);
        assert!(out.iter().all(|v| *v == 100.0));

        // 线性函数在三线性插值下被精确重建.
        let ramp = Array4::from_shape_fn((1, 8, 8, 8), |(_, i, j, k)| (i + 2 * j + 3 * k) as f32);
        let out = resample_trilinear(&ramp, &src, &dst).unwrap();
        for ((_, i, j, k), v) in out.indexed_iter() {
            let want = (i as f32 + 2.0 * j as f32 + 3.0 * k as f32) * 0.5;
            assert!(f32_eq(*v, want), "{v} != {want}");
        }
    }

    #[test]
    fn test_nearest_roundtrip() {
        let coarse = SpatialMeta::new(Affine::identity(), [6, 5, 4]);
        let fine = spacing_meta(&coarse, [0.5; 3]).unwrap();
        let labels = Array3::from_shape_fn((6, 5, 4), |(i, j, k)| ((i * 7 + j * 3 + k) % 3) as u8);

        let up = resample_nearest(labels.view(), &coarse, &fine).unwrap();
        assert_eq!(up.dim(), (11, 9, 7));
        let down = resample_nearest(up.view(), &fine, &coarse).unwrap();
        assert_eq!(down, labels);
    }
}
