use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use ndarray::{Array3, Array4, Array5, ArrayView4, Axis};
use once_cell::sync::OnceCell;

use crate::config::{BlendMode, SegConfig};
use crate::inference::blend::{importance_map, PredictionAccumulator};
use crate::inference::{Padding, SegmentationModel, Window, WindowGrid};
use crate::{SegError, SegResult, Shape3d, Stage};

/// 带重叠融合的滑窗推理器.
///
/// 融合权重只依赖 ROI 大小和融合模式, 首次使用时计算一次, 之后在所有体数据间复用.
#[derive(Clone, Debug)]
pub struct SlidingWindowInferer {
    roi: Shape3d,
    overlap: f64,
    batch_size: usize,
    mode: BlendMode,
    sigma_scale: f64,
    importance: OnceCell<Array3<f32>>,
}

impl SlidingWindowInferer {
    /// 创建推理器. 参数合法性由 [`SegConfig::validate`] 负责.
    pub fn new(roi: Shape3d, overlap: f64, batch_size: usize, mode: BlendMode, sigma_scale: f64) -> Self {
        Self {
            roi,
            overlap,
            batch_size: batch_size.max(1),
            mode,
            sigma_scale,
            importance: OnceCell::new(),
        }
    }

    /// 从配置创建.
    #[inline]
    pub fn from_config(config: &SegConfig) -> Self {
        Self::new(
            config.roi_size,
            config.overlap,
            config.batch_size,
            config.blend_mode,
            config.sigma_scale,
        )
    }

    /// 窗口大小.
    #[inline]
    pub fn roi(&self) -> Shape3d {
        self.roi
    }

    /// 每批窗口数.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 融合权重.
    #[inline]
    pub fn importance(&self) -> &Array3<f32> {
        self.importance
            .get_or_init(|| importance_map(self.roi, self.mode, self.sigma_scale))
    }

    /// 形状为 `shape` 的体数据所需的填充, 以及填充后的滑窗网格.
    pub fn plan(&self, shape: Shape3d) -> SegResult<(Padding, WindowGrid)> {
        if shape.contains(&0) {
            return Err(SegError::geometry(
                Stage::SlidingWindow,
                format!("empty spatial axis in shape {shape:?}"),
            ));
        }
        let padding = Padding::for_roi(shape, self.roi);
        let grid = WindowGrid::new(padding.padded_shape(shape), self.roi, self.overlap)?;
        Ok((padding, grid))
    }

    /// 对通道优先的输入 `[C, i, j, k]` 运行滑窗推理, 返回融合后的类别得分 `[K, i, j, k]`.
    #[inline]
    pub fn infer<M>(&self, model: &M, input: ArrayView4<'_, f32>) -> SegResult<Array4<f32>>
    where
        M: SegmentationModel + ?Sized,
    {
        self.infer_with_cancel(model, input, &AtomicBool::new(false))
    }

    /// 同 [`Self::infer`], 但在每批窗口之前检查 `cancel`.
    ///
    /// `cancel` 被置位时返回 [`SegError::Cancelled`]. 正在执行的模型调用不会被打断.
    pub fn infer_with_cancel<M>(
        &self,
        model: &M,
        input: ArrayView4<'_, f32>,
        cancel: &AtomicBool,
    ) -> SegResult<Array4<f32>>
    where
        M: SegmentationModel + ?Sized,
    {
        let (channels, ni, nj, nk) = input.dim();
        let shape = [ni, nj, nk];
        let (padding, grid) = self.plan(shape)?;
        let padded = if padding.is_empty() {
            input.to_owned()
        } else {
            debug!(
                "padding {:?} to {:?} (before {:?}, after {:?})",
                shape,
                grid.shape(),
                padding.before(),
                padding.after()
            );
            padding.pad(input)
        };

        let windows: Vec<Window> = grid.iter().collect();
        let total = windows.len();
        let importance = self.importance();
        let [ri, rj, rk] = self.roi;
        info!(
            "sliding window: {} windows of {:?} over {:?}, batch size {}",
            total,
            self.roi,
            grid.shape(),
            self.batch_size
        );

        let mut acc: Option<PredictionAccumulator> = None;
        for (b, chunk) in windows.chunks(self.batch_size).enumerate() {
            let completed = b * self.batch_size;
            if cancel.load(Ordering::Relaxed) {
                return Err(SegError::Cancelled {
                    stage: Stage::SlidingWindow,
                    completed,
                    total,
                });
            }

            let mut batch = Array5::<f32>::zeros((chunk.len(), channels, ri, rj, rk));
            for (mut dst, w) in batch.axis_iter_mut(Axis(0)).zip(chunk) {
                dst.assign(&padded.slice(w.slice_info()));
            }

            let out = model
                .predict(batch.view())
                .map_err(|source| SegError::InferenceFailure {
                    stage: Stage::SlidingWindow,
                    batch: b,
                    source,
                })?;

            let classes = acc.as_ref().map_or(out.len_of(Axis(1)), |a| a.classes());
            let expected = [chunk.len(), classes, ri, rj, rk];
            if out.shape() != expected.as_slice() || classes == 0 {
                return Err(SegError::shape(Stage::SlidingWindow, &expected, out.shape()));
            }

            let sink = acc.get_or_insert_with(|| PredictionAccumulator::new(classes, grid.shape()));
            for (scores, w) in out.axis_iter(Axis(0)).zip(chunk) {
                sink.add(w, scores, importance.view());
            }
            debug!(
                "batch {b}: windows {}..{} of {total} done",
                completed,
                completed + chunk.len()
            );
        }

        let acc = acc.ok_or_else(|| SegError::InternalConsistency {
            stage: Stage::SlidingWindow,
            detail: "no window was generated".to_string(),
        })?;
        let blended = padding.crop(acc.finalize()?, shape);
        let expected = [blended.len_of(Axis(0)), ni, nj, nk];
        if blended.shape() != expected.as_slice() {
            return Err(SegError::shape(Stage::SlidingWindow, &expected, blended.shape()));
        }
        Ok(blended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ModelError;
    use ndarray::ArrayView5;
    use std::cell::Cell;

    /// 输出与窗口位置无关的确定性得分: 类别 1 为输入值, 类别 0 为其相反数.
    fn echo(x: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let (b, _, i, j, k) = x.dim();
        let mut out = Array5::zeros((b, 2, i, j, k));
        for n in 0..b {
            let src = x.index_axis(Axis(0), n).index_axis(Axis(0), 0).to_owned();
            out.slice_mut(ndarray::s![n, 1, .., .., ..]).assign(&src);
            out.slice_mut(ndarray::s![n, 0, .., .., ..]).assign(&src.mapv(|v| -v));
        }
        Ok(out)
    }

    fn ramp(shape: Shape3d) -> Array4<f32> {
        let [i, j, k] = shape;
        Array4::from_shape_fn((1, i, j, k), |(_, a, b, c)| (a * 3 + b * 5 + c * 7) as f32 * 0.01)
    }

    fn rel_eq(a: &Array4<f32>, b: &Array4<f32>) -> bool {
        a.shape() == b.shape()
            && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= 1e-5 * (1.0 + x.abs().max(y.abs())))
    }

    #[test]
    fn test_echo_model_is_reproduced() {
        // 每个窗口都原样输出输入, 融合结果必须与输入相同.
        let input = ramp([21, 17, 13]);
        let inf = SlidingWindowInferer::new([8, 8, 8], 0.4, 3, BlendMode::Gaussian, 0.125);
        let out = inf.infer(&echo, input.view()).unwrap();
        assert_eq!(out.shape(), &[2, 21, 17, 13]);
        assert!(rel_eq(&out.slice(ndarray::s![1..2, .., .., ..]).to_owned(), &input));
    }

    #[test]
    fn test_batch_size_invariance() {
        let input = ramp([20, 14, 11]);
        let windows_seen = Cell::new(0usize);
        let model = |x: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> {
            windows_seen.set(windows_seen.get() + x.len_of(Axis(0)));
            // 叠加与窗口内局部位置相关的项, 使重叠区域内各窗口的输出互不相同.
            let mut out = echo(x)?;
            for ((_, _, a, _, _), v) in out.indexed_iter_mut() {
                *v = (*v * 3.0).sin() + a as f32 * 0.1;
            }
            Ok(out)
        };

        let base = SlidingWindowInferer::new([6, 6, 6], 0.5, 1, BlendMode::Gaussian, 0.125)
            .infer(&model, input.view())
            .unwrap();
        let n = windows_seen.get();
        for batch_size in [2, 3, 7, 1000] {
            let inf = SlidingWindowInferer::new([6, 6, 6], 0.5, batch_size, BlendMode::Gaussian, 0.125);
            let out = inf.infer(&model, input.view()).unwrap();
            assert!(rel_eq(&out, &base), "batch size {batch_size}");
        }
        assert_eq!(windows_seen.get(), n * 5);
    }

    #[test]
    fn test_tiny_volume_is_padded_then_cropped() {
        let input = ramp([3, 5, 2]);
        let inf = SlidingWindowInferer::new([8, 8, 8], 0.4, 2, BlendMode::Gaussian, 0.125);
        let (padding, grid) = inf.plan([3, 5, 2]).unwrap();
        assert_eq!(grid.shape(), [8, 8, 8]);
        assert_eq!(grid.len(), 1);
        assert_eq!(padding.before(), [2, 1, 3]);

        let out = inf.infer(&echo, input.view()).unwrap();
        assert_eq!(out.shape(), &[2, 3, 5, 2]);
        assert!(rel_eq(&out.slice(ndarray::s![1..2, .., .., ..]).to_owned(), &input));
    }

    #[test]
    fn test_empty_volume_is_rejected() {
        let inf = SlidingWindowInferer::new([8, 8, 8], 0.4, 2, BlendMode::Gaussian, 0.125);
        let input = Array4::<f32>::zeros((1, 0, 4, 4));
        let e = inf.infer(&echo, input.view()).unwrap_err();
        assert!(matches!(e, SegError::GeometryInconsistency { stage: Stage::SlidingWindow, .. }));
    }

    #[test]
    fn test_model_failure_and_bad_shape() {
        let input = ramp([10, 10, 10]);
        let inf = SlidingWindowInferer::new([6, 6, 6], 0.4, 2, BlendMode::Uniform, 0.125);

        let calls = Cell::new(0usize);
        let failing = |x: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> {
            calls.set(calls.get() + 1);
            if calls.get() == 2 {
                Err("out of memory".into())
            } else {
                echo(x)
            }
        };
        match inf.infer(&failing, input.view()) {
            Err(SegError::InferenceFailure { batch, .. }) => assert_eq!(batch, 1),
            other => panic!("unexpected {other:?}"),
        }

        let truncated = |x: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> {
            let (b, _, i, j, _) = x.dim();
            Ok(Array5::zeros((b, 2, i, j, 1)))
        };
        let e = inf.infer(&truncated, input.view()).unwrap_err();
        assert!(matches!(e, SegError::UnexpectedOutputShape { .. }));
    }

    #[test]
    fn test_cancel_between_batches() {
        let input = ramp([10, 10, 10]);
        let inf = SlidingWindowInferer::new([6, 6, 6], 0.4, 2, BlendMode::Gaussian, 0.125);
        let cancel = AtomicBool::new(false);
        let model = |x: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> {
            cancel.store(true, Ordering::Relaxed);
            echo(x)
        };
        let e = inf.infer_with_cancel(&model, input.view(), &cancel).unwrap_err();
        assert!(matches!(e, SegError::Cancelled { completed: 2, total: 27, .. }));
    }
}
