//! 窗口边缘退化的阈值模型.

use lesion_seg::prelude::*;
use ndarray::{Array5, ArrayView5, Axis};

/// 预处理后强度高于该值的体素被视为病灶.
const THRESHOLD: f32 = -0.985;

/// 模拟感受野不完整的网络: 越靠近窗口边缘, 越倾向于把背景误判为病灶.
#[derive(Copy, Clone, Debug)]
pub struct BorderDegraded {
    /// 窗口边缘处的额外病灶得分.
    pub border_bias: f32,
}

impl BorderDegraded {
    /// 窗口内局部坐标 `(a, b, c)` 到窗口边缘的归一化接近程度, 中心为 0, 边缘为 1.
    #[inline]
    fn edge((a, b, c): (usize, usize, usize), (ni, nj, nk): (usize, usize, usize)) -> f32 {
        let r = |p: usize, n: usize| {
            if n <= 1 {
                0.0
            } else {
                (2.0 * p as f32 / (n - 1) as f32 - 1.0).abs()
            }
        };
        r(a, ni).max(r(b, nj)).max(r(c, nk))
    }
}

impl SegmentationModel for BorderDegraded {
    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let (b, _, i, j, k) = batch.dim();
        let mut out = Array5::zeros((b, 2, i, j, k));
        for (input, mut scores) in batch.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            let channel = input.index_axis(Axis(0), 0);
            for (pos, v) in channel.indexed_iter() {
                let (a, p, q) = pos;
                let bias = self.border_bias * Self::edge(pos, (i, j, k)).powi(6);
                scores[(1, a, p, q)] = (*v - THRESHOLD) * 400.0 + bias;
            }
        }
        Ok(out)
    }
}
