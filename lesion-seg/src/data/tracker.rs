//! 空间元信息追踪.
//!
//! 每个具名字段 (`image`, `prediction`) 在任意阶段都只有一份权威记录.
//! 任何改变网格或方向的阶段都必须先 [`GeometryTracker::verify`] 再
//! [`GeometryTracker::record`], 否则回写到原始空间时会出现静默错误.

use log::debug;

use crate::data::{Affine, Orientation};
use crate::{SegError, SegResult, Shape3d, Stage};

/// 被追踪的数据字段.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    /// 输入图像.
    Image,
    /// 网络预测.
    Prediction,
}

impl Field {
    #[inline]
    const fn index(&self) -> usize {
        match self {
            Field::Image => 0,
            Field::Prediction => 1,
        }
    }

    /// 字段名.
    pub const fn name(&self) -> &'static str {
        match self {
            Field::Image => "image",
            Field::Prediction => "prediction",
        }
    }
}

/// 空间元信息: 仿射矩阵和空间形状. 体素间距由仿射推导.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpatialMeta {
    /// 体素到物理坐标的仿射.
    pub affine: Affine,
    /// 空间形状 `[i, j, k]`.
    pub shape: Shape3d,
}

impl SpatialMeta {
    /// 构建.
    #[inline]
    pub fn new(affine: Affine, shape: Shape3d) -> Self {
        Self { affine, shape }
    }

    /// 体素间距.
    #[inline]
    pub fn spacing(&self) -> [f64; 3] {
        self.affine.spacing()
    }

    /// 方向编码.
    #[inline]
    pub fn orientation(&self) -> Orientation {
        Orientation::from_affine(&self.affine)
    }

    /// 与 `other` 是否描述同一网格 (形状相同, 仿射近似相等)?
    #[inline]
    pub fn same_grid(&self, other: &SpatialMeta) -> bool {
        self.shape == other.shape && self.affine.close_to(&other.affine)
    }
}

/// 随数据一起流经整个流水线的几何记录.
#[derive(Clone, Debug)]
pub struct GeometryTracker {
    original: SpatialMeta,
    original_orientation: Orientation,
    current: [Option<SpatialMeta>; 2],
    reference: Option<SpatialMeta>,
    history: Vec<(Stage, Field, SpatialMeta)>,
}

impl GeometryTracker {
    /// 以输入图像的原始几何初始化. `image` 字段的当前记录即为原始记录.
    pub fn new(affine: Affine, shape: Shape3d) -> Self {
        let original = SpatialMeta::new(affine, shape);
        let original_orientation = original.orientation();
        debug!(
            "original geometry: shape {:?}, spacing {:?}, axis codes {}",
            shape,
            original.spacing(),
            original_orientation
        );
        Self {
            original,
            original_orientation,
            current: [Some(original), None],
            reference: None,
            history: vec![(Stage::Load, Field::Image, original)],
        }
    }

    /// 原始仿射矩阵.
    #[inline]
    pub fn original_affine(&self) -> Affine {
        self.original.affine
    }

    /// 原始空间形状.
    #[inline]
    pub fn original_shape(&self) -> Shape3d {
        self.original.shape
    }

    /// 原始方向编码.
    #[inline]
    pub fn original_orientation(&self) -> Orientation {
        self.original_orientation
    }

    /// `field` 的当前记录. 字段尚未被记录时返回 `None`.
    #[inline]
    pub fn current(&self, field: Field) -> Option<&SpatialMeta> {
        self.current[field.index()].as_ref()
    }

    /// `field` 的当前仿射矩阵.
    #[inline]
    pub fn current_affine(&self, field: Field) -> Option<Affine> {
        self.current(field).map(|m| m.affine)
    }

    /// `field` 的当前空间形状.
    #[inline]
    pub fn current_shape(&self, field: Field) -> Option<Shape3d> {
        self.current(field).map(|m| m.shape)
    }

    /// 获取 `field` 的当前记录, 不存在时视为几何不一致.
    pub fn require(&self, stage: Stage, field: Field) -> SegResult<SpatialMeta> {
        self.current(field).copied().ok_or_else(|| {
            SegError::geometry(stage, format!("no record for field `{}`", field.name()))
        })
    }

    /// 检查 `field` 的当前记录形状与实际数组空间形状 `actual` 一致.
    pub fn verify(&self, stage: Stage, field: Field, actual: Shape3d) -> SegResult<()> {
        let meta = self.require(stage, field)?;
        if meta.shape != actual {
            return Err(SegError::geometry(
                stage,
                format!(
                    "tracked shape {:?} of `{}` differs from array shape {:?}",
                    meta.shape,
                    field.name(),
                    actual
                ),
            ));
        }
        Ok(())
    }

    /// 更新 `field` 的记录.
    pub fn record(&mut self, stage: Stage, field: Field, meta: SpatialMeta) {
        debug!(
            "[{stage}] {}: shape {:?}, spacing {:?}, axis codes {}",
            field.name(),
            meta.shape,
            meta.spacing(),
            meta.orientation()
        );
        self.current[field.index()] = Some(meta);
        self.history.push((stage, field, meta));
    }

    /// 将 `image` 的当前记录复制为 `prediction` 的初始记录.
    ///
    /// 网络输出与输入处于同一网格, 这是 `prediction` 字段的起点.
    pub fn fork_prediction(&mut self, stage: Stage) -> SegResult<()> {
        let meta = self.require(stage, Field::Image)?;
        self.record(stage, Field::Prediction, meta);
        Ok(())
    }

    /// 将 `image` 的当前记录标记为回写参考网格.
    pub fn mark_reference(&mut self, stage: Stage) -> SegResult<()> {
        let meta = self.require(stage, Field::Image)?;
        self.reference = Some(meta);
        Ok(())
    }

    /// 回写参考网格.
    pub fn reference(&self, stage: Stage) -> SegResult<SpatialMeta> {
        self.reference
            .ok_or_else(|| SegError::geometry(stage, "reference grid was never recorded"))
    }

    /// 所有记录过的几何变化, 按发生顺序排列.
    #[inline]
    pub fn history(&self) -> &[(Stage, Field, SpatialMeta)] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_verify() {
        let a0 = Affine::from_spacing([-1.0, 1.0, 1.0], [0.0; 3]);
        let mut t = GeometryTracker::new(a0, [4, 5, 6]);
        assert_eq!(t.original_orientation().to_string(), "LAS");
        assert_eq!(t.current_shape(Field::Image), Some([4, 5, 6]));
        assert!(t.current(Field::Prediction).is_none());
        assert!(t.verify(Stage::Orientation, Field::Image, [4, 5, 6]).is_ok());

        let e = t.verify(Stage::Spacing, Field::Image, [4, 5, 7]).unwrap_err();
        assert_eq!(e.stage(), Some(Stage::Spacing));
        assert!(matches!(e, SegError::GeometryInconsistency { .. }));
        assert!(t.verify(Stage::Restore, Field::Prediction, [4, 5, 6]).is_err());
        assert!(t.reference(Stage::Restore).is_err());

        let a1 = Affine::from_spacing([0.5, 1.0, 1.0], [0.0; 3]);
        t.mark_reference(Stage::Orientation).unwrap();
        t.record(Stage::Spacing, Field::Image, SpatialMeta::new(a1, [8, 5, 6]));
        t.fork_prediction(Stage::SlidingWindow).unwrap();

        assert_eq!(t.current_affine(Field::Prediction), Some(a1));
        assert_eq!(t.reference(Stage::Restore).unwrap().shape, [4, 5, 6]);
        assert_eq!(t.original_shape(), [4, 5, 6]);
        assert_eq!(t.original_affine(), a0);
        assert_eq!(t.history().len(), 3);
    }
}
