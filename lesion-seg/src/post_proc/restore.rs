//! 把预测结果回写到参考网格.

use log::debug;
use ndarray::Array3;

use crate::data::{AxisTransform, Field, GeometryTracker, LabelVolume, SpatialMeta};
use crate::transforms::resample::resample_nearest;
use crate::{SegError, SegResult, Stage};

/// 将处理网格上的标签 `labels` 最近邻重采样到 `tracker` 记录的参考网格.
///
/// `invert_orientation` 为真时, 再把结果从参考方向置换/翻转回输入的原始方向,
/// 此时输出几何必须与输入的原始几何一致.
///
/// 每一步都会更新 `prediction` 字段的记录, 返回的标签体数据的仿射即为最终记录.
pub fn restore(
    labels: Array3<u8>,
    tracker: &mut GeometryTracker,
    invert_orientation: bool,
) -> SegResult<LabelVolume> {
    let (i, j, k) = labels.dim();
    tracker.verify(Stage::Restore, Field::Prediction, [i, j, k])?;
    let current = tracker.require(Stage::Restore, Field::Prediction)?;
    let reference = tracker.reference(Stage::Restore)?;

    let mut out = if current.same_grid(&reference) {
        labels
    } else {
        resample_nearest(labels.view(), &current, &reference)?
    };
    let (ri, rj, rk) = out.dim();
    if [ri, rj, rk] != reference.shape {
        return Err(SegError::shape(Stage::Restore, &reference.shape, &[ri, rj, rk]));
    }
    tracker.record(Stage::Restore, Field::Prediction, reference);
    let mut meta = reference;

    if invert_orientation {
        let t = AxisTransform::between(&reference.orientation(), &tracker.original_orientation());
        if !t.is_identity() {
            out = t.apply_3d(&out);
            meta = SpatialMeta::new(
                reference.affine * t.index_affine(reference.shape),
                t.output_shape(reference.shape),
            );
            tracker.record(Stage::Restore, Field::Prediction, meta);
        }
        let original = SpatialMeta::new(tracker.original_affine(), tracker.original_shape());
        if !meta.same_grid(&original) {
            return Err(SegError::geometry(
                Stage::Restore,
                format!(
                    "inverted grid (shape {:?}, axis codes {}) does not match the input grid (shape {:?}, axis codes {})",
                    meta.shape,
                    meta.orientation(),
                    original.shape,
                    original.orientation()
                ),
            ));
        }
        debug!("[{}] orientation restored to {}", Stage::Restore, meta.orientation());
    }

    Ok(LabelVolume::new(out, meta.affine))
}
