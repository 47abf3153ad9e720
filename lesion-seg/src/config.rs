//! 流水线配置.
//!
//! 配置只是普通数据, 通过构造函数显式传入流水线. 不存在进程级全局状态.

use crate::consts::*;
use crate::{SegError, SegResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 重叠窗口的融合权重模式.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BlendMode {
    /// 中心高, 边缘低的高斯权重.
    #[default]
    Gaussian,

    /// 均匀权重.
    Uniform,
}

/// 三维体素连通性.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Connectivity {
    /// 6-邻域 (钻石型, 仅共面).
    Face,

    /// 26-邻域 (共面, 共边或共点).
    #[default]
    Full,
}

/// 强度区间线性映射参数: `[a_min, a_max] -> [b_min, b_max]`.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IntensityRange {
    /// 假定的输入下限.
    pub a_min: f32,
    /// 假定的输入上限.
    pub a_max: f32,
    /// 目标下限.
    pub b_min: f32,
    /// 目标上限.
    pub b_max: f32,
    /// 是否把结果截断到 `[b_min, b_max]`.
    pub clip: bool,
}

impl Default for IntensityRange {
    fn default() -> Self {
        Self {
            a_min: 0.0,
            a_max: 255.0,
            b_min: -1.0,
            b_max: 1.0,
            clip: true,
        }
    }
}

impl IntensityRange {
    /// 对单个强度值进行映射.
    #[inline]
    pub fn eval(&self, v: f32) -> f32 {
        let ans = (v - self.a_min) / (self.a_max - self.a_min) * (self.b_max - self.b_min) + self.b_min;
        if self.clip {
            num::clamp(ans, self.b_min, self.b_max)
        } else {
            ans
        }
    }
}

/// 分割流水线配置.
///
/// 默认值与预训练模型的训练设置一致, 一般情况下无需修改.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegConfig {
    /// 滑窗 ROI 大小, 以体素为单位.
    pub roi_size: [usize; 3],

    /// 目标体素间距, 以毫米为单位.
    pub target_spacing: [f64; 3],

    /// 相邻窗口重叠比例, `0 <= overlap < 1`.
    pub overlap: f64,

    /// 每次模型调用包含的窗口数上限.
    pub batch_size: usize,

    /// 融合权重模式.
    pub blend_mode: BlendMode,

    /// 高斯融合权重的 sigma 与 ROI 边长之比.
    pub sigma_scale: f64,

    /// 预处理高斯平滑的 sigma (体素单位). 为 0 时跳过平滑.
    pub smoothing_sigma: f64,

    /// 是否仅使用非零体素计算归一化统计量.
    pub normalize_nonzero: bool,

    /// 强度区间映射.
    pub intensity: IntensityRange,

    /// 是否只保留最大连通域.
    pub keep_largest_component: bool,

    /// 最大连通域过滤使用的连通性.
    pub connectivity: Connectivity,

    /// 是否把结果反向重定向回输入的原始方向.
    pub invert_orientation: bool,

    /// 类别索引 `j` 写出时对应的标签值. 长度必须等于模型输出类别数.
    pub label_values: Vec<u8>,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            roi_size: DEFAULT_ROI_SIZE,
            target_spacing: DEFAULT_TARGET_SPACING,
            overlap: DEFAULT_OVERLAP,
            batch_size: DEFAULT_BATCH_SIZE,
            blend_mode: BlendMode::Gaussian,
            sigma_scale: DEFAULT_SIGMA_SCALE,
            smoothing_sigma: DEFAULT_SMOOTHING_SIGMA,
            normalize_nonzero: true,
            intensity: IntensityRange::default(),
            keep_largest_component: false,
            connectivity: Connectivity::Full,
            invert_orientation: false,
            label_values: vec![label::BACKGROUND, label::LESION],
        }
    }
}

impl SegConfig {
    /// 设置 ROI 大小.
    pub fn with_roi_size(mut self, roi_size: [usize; 3]) -> Self {
        self.roi_size = roi_size;
        self
    }

    /// 设置目标体素间距.
    pub fn with_target_spacing(mut self, spacing: [f64; 3]) -> Self {
        self.target_spacing = spacing;
        self
    }

    /// 设置重叠比例.
    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.overlap = overlap;
        self
    }

    /// 设置批大小.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// 设置融合权重模式.
    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    /// 设置平滑 sigma.
    pub fn with_smoothing_sigma(mut self, sigma: f64) -> Self {
        self.smoothing_sigma = sigma;
        self
    }

    /// 设置强度区间映射.
    pub fn with_intensity(mut self, intensity: IntensityRange) -> Self {
        self.intensity = intensity;
        self
    }

    /// 打开或关闭最大连通域过滤.
    pub fn with_largest_component(mut self, on: bool, connectivity: Connectivity) -> Self {
        self.keep_largest_component = on;
        self.connectivity = connectivity;
        self
    }

    /// 打开或关闭反向重定向.
    pub fn with_invert_orientation(mut self, on: bool) -> Self {
        self.invert_orientation = on;
        self
    }

    /// 设置类别到标签值的映射.
    pub fn with_label_values(mut self, values: Vec<u8>) -> Self {
        self.label_values = values;
        self
    }

    /// 检查配置合法性.
    pub fn validate(&self) -> SegResult<()> {
        fn invalid<T>(msg: String) -> SegResult<T> {
            Err(SegError::InvalidConfig(msg))
        }

        if self.roi_size.iter().any(|&r| r == 0) {
            return invalid(format!("roi_size must be positive, got {:?}", self.roi_size));
        }
        if self
            .target_spacing
            .iter()
            .any(|&s| !(s.is_finite() && s > 0.0))
        {
            return invalid(format!(
                "target_spacing must be positive and finite, got {:?}",
                self.target_spacing
            ));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return invalid(format!("overlap must lie in [0, 1), got {}", self.overlap));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_string());
        }
        if !(self.sigma_scale.is_finite() && self.sigma_scale > 0.0) {
            return invalid(format!("sigma_scale must be positive, got {}", self.sigma_scale));
        }
        if !(self.smoothing_sigma.is_finite() && self.smoothing_sigma >= 0.0) {
            return invalid(format!(
                "smoothing_sigma must be non-negative, got {}",
                self.smoothing_sigma
            ));
        }
        let r = &self.intensity;
        if !(r.a_max > r.a_min) || !(r.b_max >= r.b_min) {
            return invalid(format!("degenerate intensity range {r:?}"));
        }
        if self.label_values.len() < 2 {
            return invalid("label_values needs at least background and one class".to_string());
        }
        if self.label_values[0] != label::BACKGROUND {
            return invalid("class 0 must map to background".to_string());
        }
        Ok(())
    }
}
