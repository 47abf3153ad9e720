//! 后处理流程集合.
//!
//! 依次为: softmax, argmax, 类别到标签值映射, (可选) 最大连通域过滤,
//! 最近邻回写到参考网格, (可选) 反向重定向.

use log::{debug, info};
use ndarray::Array4;

use crate::config::{Connectivity, SegConfig};
use crate::consts::label;
use crate::data::{Field, GeometryTracker, LabelVolume, SpatialAttr};
use crate::{SegError, SegResult, Stage};

mod component;
mod discrete;
mod restore;

pub use component::{keep_largest_component, regions};
pub use discrete::{argmax, remap_labels, softmax};
pub use restore::restore;

/// 后处理流水线.
#[derive(Clone, Debug, PartialEq)]
pub struct PostProcessor {
    label_values: Vec<u8>,
    largest_component: Option<Connectivity>,
    invert_orientation: bool,
}

impl PostProcessor {
    /// 从配置创建.
    pub fn from_config(config: &SegConfig) -> Self {
        Self {
            label_values: config.label_values.clone(),
            largest_component: config.keep_largest_component.then_some(config.connectivity),
            invert_orientation: config.invert_orientation,
        }
    }

    /// 类别数.
    #[inline]
    pub fn classes(&self) -> usize {
        self.label_values.len()
    }

    /// 把融合后的类别得分 `[K, i, j, k]` 转换为原始空间上的标签体数据.
    ///
    /// `scores` 必须与 `tracker` 中 `prediction` 字段的记录一致, 且 `K` 等于配置的类别数.
    pub fn run(&self, mut scores: Array4<f32>, tracker: &mut GeometryTracker) -> SegResult<LabelVolume> {
        let (classes, i, j, k) = scores.dim();
        tracker.verify(Stage::Activation, Field::Prediction, [i, j, k])?;
        if classes != self.classes() {
            return Err(SegError::shape(
                Stage::Activation,
                &[self.classes(), i, j, k],
                scores.shape(),
            ));
        }

        softmax(&mut scores)?;
        let mut labels = argmax(scores.view())?;
        drop(scores);
        remap_labels(&mut labels, &self.label_values)?;
        debug!(
            "[{}] {} foreground voxel(s) on the processing grid",
            Stage::Discretize,
            labels.iter().filter(|p| label::is_foreground(**p)).count()
        );

        if let Some(connectivity) = self.largest_component {
            let removed = keep_largest_component(&mut labels, connectivity);
            debug!(
                "[{}] {removed} voxel(s) outside the largest component cleared ({connectivity:?})",
                Stage::LargestComponent
            );
        }

        let out = restore(labels, tracker, self.invert_orientation)?;
        info!(
            "post-processing done: shape {:?}, axis codes {}, {} foreground voxel(s)",
            out.data().dim(),
            out.affine().orientation(),
            out.foreground_voxels()
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Affine;
    use ndarray::s;

    fn tracker(shape: [usize; 3]) -> GeometryTracker {
        let mut t = GeometryTracker::new(Affine::identity(), shape);
        t.mark_reference(Stage::Orientation).unwrap();
        t.fork_prediction(Stage::SlidingWindow).unwrap();
        t
    }

    fn scores_with_blobs(shape: [usize; 3]) -> Array4<f32> {
        let [a, b, c] = shape;
        let mut s = Array4::<f32>::zeros((2, a, b, c));
        s.slice_mut(s![0, .., .., ..]).fill(2.0);
        // 大块 3x3x3 与孤立点.
        s.slice_mut(s![1, 1..4, 1..4, 1..4]).fill(5.0);
        s[(1, 7, 7, 7)] = 5.0;
        s
    }

    #[test]
    fn test_run_default() {
        let mut t = tracker([8, 8, 8]);
        let pp = PostProcessor::from_config(&SegConfig::default());
        let out = pp.run(scores_with_blobs([8, 8, 8]), &mut t).unwrap();
        assert_eq!(out.foreground_voxels(), 28);
        assert_eq!(t.current(Field::Prediction).map(|m| m.shape), Some([8, 8, 8]));
    }

    #[test]
    fn test_run_largest_component() {
        let mut t = tracker([8, 8, 8]);
        let config = SegConfig::default().with_largest_component(true, Connectivity::Face);
        let out = PostProcessor::from_config(&config)
            .run(scores_with_blobs([8, 8, 8]), &mut t)
            .unwrap();
        assert_eq!(out.foreground_voxels(), 27);
        assert_eq!(out[(7, 7, 7)], 0);
    }

    #[test]
    fn test_class_count_mismatch() {
        let mut t = tracker([2, 2, 2]);
        let pp = PostProcessor::from_config(&SegConfig::default());
        let e = pp.run(Array4::zeros((3, 2, 2, 2)), &mut t).unwrap_err();
        assert!(matches!(e, SegError::UnexpectedOutputShape { stage: Stage::Activation, .. }));

        let e = pp.run(Array4::zeros((2, 2, 2, 3)), &mut t).unwrap_err();
        assert!(matches!(e, SegError::GeometryInconsistency { .. }));
    }
}
