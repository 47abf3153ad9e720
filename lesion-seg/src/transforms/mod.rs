//! 预处理.
//!
//! 每个阶段都是 `(数据, 几何) -> (数据, 几何)` 的纯函数, 不同体数据之间不共享任何可变状态.
//! 阶段顺序由 [`Preprocessor::from_config`] 固定, 不可重排.

use log::{debug, info};
use ndarray::{Array4, ArrayD, Axis, Ix3, Ix4};

use crate::config::{IntensityRange, SegConfig};
use crate::data::{
    Affine, AxisTransform, Field, GeometryTracker, Orientation, SpatialAttr, SpatialMeta, Volume,
};
use crate::{SegError, SegResult, Stage};

pub mod intensity;
pub mod resample;
pub mod smooth;

/// 补齐通道维. 三维数组变为单通道, 四维 `[i, j, k, t]` 变为 `t` 通道 `[t, i, j, k]`.
///
/// 其它维数返回 [`SegError::GeometryInconsistency`].
pub fn ensure_channel_first(data: ArrayD<f32>) -> SegResult<Array4<f32>> {
    let shape = data.shape().to_vec();
    let err = || {
        SegError::geometry(
            Stage::ChannelFirst,
            format!("cannot add a channel dimension to shape {shape:?}"),
        )
    };
    match data.ndim() {
        3 => Ok(data
            .into_dimensionality::<Ix3>()
            .map_err(|_| err())?
            .insert_axis(Axis(0))),
        4 => Ok(data
            .into_dimensionality::<Ix4>()
            .map_err(|_| err())?
            .permuted_axes([3, 0, 1, 2])
            .as_standard_layout()
            .into_owned()),
        _ => Err(err()),
    }
}

/// 单个预处理阶段.
#[derive(Clone, Debug, PartialEq)]
pub enum Transform {
    /// 重定向到给定方向.
    Orientation(Orientation),
    /// 三线性重采样到给定体素间距.
    Spacing([f64; 3]),
    /// z-score 归一化. 为真时只统计非零体素.
    NormalizeIntensity(bool),
    /// 高斯平滑, sigma 以体素为单位.
    GaussianSmooth(f64),
    /// 强度区间线性映射.
    ScaleIntensity(IntensityRange),
}

impl Transform {
    /// 阶段名.
    pub fn stage(&self) -> Stage {
        match self {
            Transform::Orientation(_) => Stage::Orientation,
            Transform::Spacing(_) => Stage::Spacing,
            Transform::NormalizeIntensity(_) => Stage::NormalizeIntensity,
            Transform::GaussianSmooth(_) => Stage::GaussianSmooth,
            Transform::ScaleIntensity(_) => Stage::ScaleIntensity,
        }
    }

    /// 由输入几何推导该阶段的输出几何, 不触碰数据.
    pub fn expected_meta(&self, meta: &SpatialMeta) -> SegResult<SpatialMeta> {
        match self {
            Transform::Orientation(target) => {
                let t = AxisTransform::between(&meta.orientation(), target);
                Ok(SpatialMeta::new(
                    meta.affine * t.index_affine(meta.shape),
                    t.output_shape(meta.shape),
                ))
            }
            Transform::Spacing(target) => resample::spacing_meta(meta, *target),
            _ => Ok(*meta),
        }
    }

    /// 对体数据实施该阶段.
    pub fn apply(&self, volume: Volume) -> SegResult<Volume> {
        match self {
            Transform::Orientation(target) => {
                let t = AxisTransform::between(&volume.orientation(), target);
                if t.is_identity() {
                    return Ok(volume);
                }
                let shape = volume.shape();
                let (data, affine) = volume.into_parts();
                Ok(Volume::new(t.apply(&data), affine * t.index_affine(shape)))
            }
            Transform::Spacing(target) => {
                let src = volume.meta();
                let dst = resample::spacing_meta(&src, *target)?;
                if dst.same_grid(&src) {
                    return Ok(volume);
                }
                let data = resample::resample_trilinear(&volume.into_parts().0, &src, &dst)?;
                Ok(Volume::new(data, dst.affine))
            }
            Transform::NormalizeIntensity(nonzero) => {
                let (mut data, affine) = volume.into_parts();
                intensity::normalize_intensity(&mut data, *nonzero);
                Ok(Volume::new(data, affine))
            }
            Transform::GaussianSmooth(sigma) => {
                let (data, affine) = volume.into_parts();
                Ok(Volume::new(smooth::gaussian_smooth(&data, *sigma), affine))
            }
            Transform::ScaleIntensity(range) => {
                let (mut data, affine) = volume.into_parts();
                intensity::scale_intensity(&mut data, range);
                Ok(Volume::new(data, affine))
            }
        }
    }
}

/// 预处理流水线.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    transforms: Vec<Transform>,
}

impl Preprocessor {
    /// 按固定顺序构建: 重定向到 RAS, 重采样, 归一化, 平滑 (sigma 为 0 时省略), 区间映射.
    pub fn from_config(config: &SegConfig) -> Self {
        let mut transforms = vec![
            Transform::Orientation(Orientation::RAS),
            Transform::Spacing(config.target_spacing),
            Transform::NormalizeIntensity(config.normalize_nonzero),
        ];
        if config.smoothing_sigma > 0.0 {
            transforms.push(Transform::GaussianSmooth(config.smoothing_sigma));
        }
        transforms.push(Transform::ScaleIntensity(config.intensity));
        Self { transforms }
    }

    /// 阶段列表.
    #[inline]
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// 对原始数组运行全部阶段.
    ///
    /// 返回预处理后的体数据和几何记录. 几何记录中 `image` 字段与返回数据一致,
    /// 参考网格为重定向之后, 重采样之前的网格.
    pub fn run(&self, data: ArrayD<f32>, affine: Affine) -> SegResult<(Volume, GeometryTracker)> {
        let shape = match data.shape() {
            [i, j, k, ..] => [*i, *j, *k],
            other => {
                return Err(SegError::geometry(
                    Stage::ChannelFirst,
                    format!("expected at least 3 dimensions, got {other:?}"),
                ))
            }
        };
        if shape.contains(&0) {
            return Err(SegError::geometry(
                Stage::ChannelFirst,
                format!("empty spatial axis in shape {shape:?}"),
            ));
        }
        let mut tracker = GeometryTracker::new(affine, shape);

        let mut volume = Volume::new(ensure_channel_first(data)?, affine);
        tracker.verify(Stage::ChannelFirst, Field::Image, volume.shape())?;
        tracker.mark_reference(Stage::ChannelFirst)?;
        debug!("[{}] {} channel(s)", Stage::ChannelFirst, volume.channels());

        for t in self.transforms.iter() {
            let stage = t.stage();
            tracker.verify(stage, Field::Image, volume.shape())?;
            let before = tracker.require(stage, Field::Image)?;
            if !before.affine.close_to(&volume.affine()) {
                return Err(SegError::geometry(
                    stage,
                    "tracked affine differs from the volume affine",
                ));
            }

            let expected = t.expected_meta(&before)?;
            volume = t.apply(volume)?;
            if !volume.meta().same_grid(&expected) {
                return Err(SegError::geometry(
                    stage,
                    format!(
                        "stage produced shape {:?}, tracked geometry expects {:?}",
                        volume.shape(),
                        expected.shape
                    ),
                ));
            }
            if !expected.same_grid(&before) {
                tracker.record(stage, Field::Image, expected);
            }
            if let Transform::Orientation(_) = t {
                tracker.mark_reference(stage)?;
            }
        }

        info!(
            "pre-processing done: shape {:?}, spacing {:?}, axis codes {}",
            volume.shape(),
            volume.spacing(),
            volume.orientation()
        );
        Ok((volume, tracker))
    }
}
