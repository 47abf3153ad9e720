//! 重叠窗口的加权融合.

use ndarray::{s, Array1, Array3, Array4, ArrayView3, ArrayView4, Axis, Zip};
use ordered_float::OrderedFloat;

use crate::config::BlendMode;
use crate::consts::MIN_IMPORTANCE;
use crate::inference::Window;
use crate::{SegError, SegResult, Shape3d, Stage};

/// 单轴高斯权重, 中心为 `(n - 1) / 2`, `sigma = sigma_scale * n`.
fn gaussian_1d(n: usize, sigma_scale: f64) -> Array1<f64> {
    let sigma = (sigma_scale * n as f64).max(f64::EPSILON);
    let center = (n as f64 - 1.0) / 2.0;
    Array1::from_shape_fn(n, |i| {
        let x = i as f64 - center;
        (-x * x / (2.0 * sigma * sigma)).exp()
    })
}

/// 窗口内每个体素的融合权重.
///
/// 高斯模式下权重为三个单轴高斯的乘积, 归一化使最大值为 1, 再截断到不低于
/// `max(min, MIN_IMPORTANCE)`, 保证窗口内每个体素都有严格为正的权重.
/// 均匀模式下权重全为 1.
pub fn importance_map(roi: Shape3d, mode: BlendMode, sigma_scale: f64) -> Array3<f32> {
    let [ni, nj, nk] = roi;
    match mode {
        BlendMode::Uniform => Array3::ones((ni, nj, nk)),
        BlendMode::Gaussian => {
            let [gi, gj, gk] = [ni, nj, nk].map(|n| gaussian_1d(n, sigma_scale));
            let map = Array3::from_shape_fn((ni, nj, nk), |(i, j, k)| gi[i] * gj[j] * gk[k]);

            let max = map.iter().copied().map(OrderedFloat).max().map_or(1.0, |m| m.0);
            let mut map = map.mapv(|v| (v / max) as f32);
            let min = map.iter().copied().map(OrderedFloat).min().map_or(0.0, |m| m.0);
            let floor = min.max(MIN_IMPORTANCE);
            map.mapv_inplace(|v| v.max(floor));
            map
        }
    }
}

/// 逐体素累加的加权类别得分和权重.
///
/// 累加满足交换律, 因此窗口处理顺序和批大小不影响结果 (浮点误差范围内).
#[derive(Clone, Debug)]
pub struct PredictionAccumulator {
    scores: Array4<f32>,
    weights: Array3<f32>,
}

impl PredictionAccumulator {
    /// 为 `classes` 个类别, 空间形状为 `shape` 的体数据创建全零累加器.
    pub fn new(classes: usize, shape: Shape3d) -> Self {
        let [ni, nj, nk] = shape;
        Self {
            scores: Array4::zeros((classes, ni, nj, nk)),
            weights: Array3::zeros((ni, nj, nk)),
        }
    }

    /// 类别数.
    #[inline]
    pub fn classes(&self) -> usize {
        self.scores.len_of(Axis(0))
    }

    /// 累加权重的只读视图.
    #[inline]
    pub fn weights(&self) -> ArrayView3<'_, f32> {
        self.weights.view()
    }

    /// 累加一个窗口的得分 `scores` (`[K, roi]`), 权重为 `importance` (`roi`).
    ///
    /// 调用者负责保证形状匹配, 否则 panic.
    pub fn add(&mut self, window: &Window, scores: ArrayView4<'_, f32>, importance: ArrayView3<'_, f32>) {
        let [a, b, c] = window.start;
        let [x, y, z] = window.end();

        let mut w = self.weights.slice_mut(s![a..x, b..y, c..z]);
        w += &importance;

        let mut acc = self.scores.slice_mut(s![.., a..x, b..y, c..z]);
        for (mut dst, src) in acc.axis_iter_mut(Axis(0)).zip(scores.axis_iter(Axis(0))) {
            Zip::from(&mut dst)
                .and(&src)
                .and(&importance)
                .for_each(|d, s, i| *d += s * i);
        }
    }

    /// 累加权重的最小值.
    pub fn min_weight(&self) -> f32 {
        self.weights
            .iter()
            .copied()
            .map(OrderedFloat)
            .min()
            .map_or(0.0, |m| m.0)
    }

    /// 逐体素相除, 得到融合后的得分 `[K, i, j, k]`.
    ///
    /// 任一体素累加权重不为正时返回 [`SegError::InternalConsistency`].
    pub fn finalize(self) -> SegResult<Array4<f32>> {
        let min = self.min_weight();
        if !(min > 0.0) {
            return Err(SegError::InternalConsistency {
                stage: Stage::SlidingWindow,
                detail: format!("accumulated blending weight {min} is not positive"),
            });
        }
        let Self { mut scores, weights } = self;
        for mut class in scores.axis_iter_mut(Axis(0)) {
            Zip::from(&mut class).and(&weights).for_each(|s, w| *s /= w);
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_map_shape() {
        let map = importance_map([7, 8, 9], BlendMode::Gaussian, 0.125);
        assert_eq!(map.dim(), (7, 8, 9));
        let max = map.iter().cloned().fold(0.0, f32::max);
        let min = map.iter().cloned().fold(1.0, f32::min);
        assert!((max - 1.0).abs() < 1e-6);
        assert!(min >= MIN_IMPORTANCE);
        // 中心最大, 向边缘单调递减.
        assert!((map[(3, 3, 4)] - max).abs() < 1e-6 || (map[(3, 4, 4)] - max).abs() < 1e-6);
        assert!(map[(0, 4, 4)] <= map[(1, 4, 4)]);
        assert!(map[(1, 4, 4)] <= map[(2, 4, 4)]);

        let uni = importance_map([3, 3, 3], BlendMode::Uniform, 0.125);
        assert!(uni.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_accumulate_and_finalize() {
        let mut acc = PredictionAccumulator::new(2, [4, 1, 1]);
        let imp = Array3::from_elem((3, 1, 1), 0.5f32);

        let w0 = Window { start: [0, 0, 0], size: [3, 1, 1] };
        let w1 = Window { start: [1, 0, 0], size: [3, 1, 1] };
        let s0 = Array4::from_shape_fn((2, 3, 1, 1), |(c, _, _, _)| c as f32);
        let s1 = Array4::from_shape_fn((2, 3, 1, 1), |(c, _, _, _)| 2.0 + c as f32);
        acc.add(&w0, s0.view(), imp.view());
        acc.add(&w1, s1.view(), imp.view());
        assert_eq!(acc.weights().to_owned().into_raw_vec(), vec![0.5, 1.0, 1.0, 0.5]);

        let out = acc.finalize().unwrap();
        assert_eq!(out.shape(), &[2, 4, 1, 1]);
        assert_eq!(out[(0, 0, 0, 0)], 0.0);
        assert_eq!(out[(0, 1, 0, 0)], 1.0);
        assert_eq!(out[(1, 3, 0, 0)], 3.0);
    }

    #[test]
    fn test_zero_weight_is_fatal() {
        let mut acc = PredictionAccumulator::new(1, [3, 1, 1]);
        let w = Window { start: [0, 0, 0], size: [2, 1, 1] };
        acc.add(&w, Array4::zeros((1, 2, 1, 1)).view(), Array3::ones((2, 1, 1)).view());
        let e = acc.finalize().unwrap_err();
        assert!(matches!(e, SegError::InternalConsistency { stage: Stage::SlidingWindow, .. }));
    }

    #[test]
    fn test_window_order_invariance() {
        let grid = crate::inference::WindowGrid::new([14, 11, 9], [6, 6, 6], 0.5).unwrap();
        let imp = importance_map([6, 6, 6], BlendMode::Gaussian, 0.125);
        // 得分同时依赖窗口起点和窗口内位置, 使重叠区域内各窗口互不相同.
        let scores = |w: &Window| {
            Array4::from_shape_fn((2, 6, 6, 6), |(c, a, b, d)| {
                let g = (w.start[0] + a) * 13 + (w.start[1] + b) * 7 + w.start[2] + d;
                ((g + c * 5) as f32 * 0.37).sin() + (a + 2 * w.start[1]) as f32 * 0.05
            })
        };
        let blend = |windows: &[Window]| {
            let mut acc = PredictionAccumulator::new(2, grid.shape());
            for w in windows {
                acc.add(w, scores(w).view(), imp.view());
            }
            acc.finalize().unwrap()
        };

        let forward: Vec<Window> = grid.iter().collect();
        assert!(forward.len() > 2);
        let reversed: Vec<Window> = forward.iter().rev().copied().collect();
        let mut shuffled = forward.clone();
        shuffled.sort_by_key(|w| (w.start[2], w.start[0] * 31 % 5, w.start[1]));
        assert_ne!(shuffled, forward);

        let base = blend(&forward);
        for other in [blend(&reversed), blend(&shuffled)] {
            assert!(base
                .iter()
                .zip(other.iter())
                .all(|(x, y)| (x - y).abs() <= 1e-5 * (1.0 + x.abs().max(y.abs()))));
        }
    }
}
