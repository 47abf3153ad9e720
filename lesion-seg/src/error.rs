//! 运行时错误.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::inference::ModelError;

/// 流水线阶段. 每个错误都会标明出错阶段.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// 读取输入体数据.
    Load,
    /// 通道维补齐.
    ChannelFirst,
    /// 重定向.
    Orientation,
    /// 重采样到目标间距.
    Spacing,
    /// 强度归一化.
    NormalizeIntensity,
    /// 高斯平滑.
    GaussianSmooth,
    /// 强度区间映射.
    ScaleIntensity,
    /// 滑窗推理.
    SlidingWindow,
    /// softmax 激活.
    Activation,
    /// argmax 离散化.
    Discretize,
    /// 最大连通域过滤.
    LargestComponent,
    /// 回写到参考网格.
    Restore,
    /// 写出结果.
    Save,
}

impl Stage {
    /// 阶段名.
    pub const fn name(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::ChannelFirst => "channel_first",
            Stage::Orientation => "orientation",
            Stage::Spacing => "spacing",
            Stage::NormalizeIntensity => "normalize_intensity",
            Stage::GaussianSmooth => "gaussian_smooth",
            Stage::ScaleIntensity => "scale_intensity",
            Stage::SlidingWindow => "sliding_window",
            Stage::Activation => "activation",
            Stage::Discretize => "discretize",
            Stage::LargestComponent => "largest_component",
            Stage::Restore => "restore",
            Stage::Save => "save",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 分割流水线错误. 所有错误都是致命的, 流水线内部不做重试.
#[derive(Debug, Error)]
pub enum SegError {
    /// 输入文件不存在或无法读取.
    #[error("[{stage}] input volume `{}` not found or unreadable: {reason}", .path.display())]
    InputNotFound {
        /// 出错阶段.
        stage: Stage,
        /// 输入路径.
        path: PathBuf,
        /// 底层原因.
        reason: String,
    },

    /// 记录的几何信息与实际数组不一致.
    #[error("[{stage}] geometry inconsistency: {detail}")]
    GeometryInconsistency {
        /// 出错阶段.
        stage: Stage,
        /// 细节.
        detail: String,
    },

    /// 权重缺失, 损坏或与网络结构不匹配.
    #[error("model load failure for `{}`: {source}", .path.display())]
    ModelLoadFailure {
        /// 权重路径.
        path: PathBuf,
        /// 底层原因.
        #[source]
        source: ModelError,
    },

    /// 模型在某个窗口批次上失败.
    #[error("[{stage}] inference failed on window batch {batch}: {source}")]
    InferenceFailure {
        /// 出错阶段.
        stage: Stage,
        /// 批次序号 (从 0 开始).
        batch: usize,
        /// 底层原因.
        #[source]
        source: ModelError,
    },

    /// 输出形状与期望不符.
    #[error("[{stage}] unexpected output shape: expected {expected:?}, got {actual:?}")]
    UnexpectedOutputShape {
        /// 出错阶段.
        stage: Stage,
        /// 期望形状.
        expected: Vec<usize>,
        /// 实际形状.
        actual: Vec<usize>,
    },

    /// 内部一致性被破坏 (例如融合权重为零). 属于程序缺陷.
    #[error("[{stage}] internal consistency violated: {detail}")]
    InternalConsistency {
        /// 出错阶段.
        stage: Stage,
        /// 细节.
        detail: String,
    },

    /// 配置非法.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 写出结果失败.
    #[error("[{stage}] failed to write `{}`: {reason}", .path.display())]
    OutputWrite {
        /// 出错阶段.
        stage: Stage,
        /// 输出路径.
        path: PathBuf,
        /// 底层原因.
        reason: String,
    },

    /// 推理在批次之间被外部取消.
    #[error("[{stage}] cancelled after {completed} of {total} windows")]
    Cancelled {
        /// 出错阶段.
        stage: Stage,
        /// 已完成窗口数.
        completed: usize,
        /// 总窗口数.
        total: usize,
    },
}

impl SegError {
    /// 构造几何不一致错误.
    pub(crate) fn geometry(stage: Stage, detail: impl Into<String>) -> Self {
        Self::GeometryInconsistency {
            stage,
            detail: detail.into(),
        }
    }

    /// 构造形状不符错误.
    pub(crate) fn shape(stage: Stage, expected: &[usize], actual: &[usize]) -> Self {
        Self::UnexpectedOutputShape {
            stage,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// 获取出错阶段. 配置错误和权重加载错误不属于任何流水线阶段.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::InputNotFound { stage, .. }
            | Self::GeometryInconsistency { stage, .. }
            | Self::InferenceFailure { stage, .. }
            | Self::UnexpectedOutputShape { stage, .. }
            | Self::InternalConsistency { stage, .. }
            | Self::OutputWrite { stage, .. }
            | Self::Cancelled { stage, .. } => Some(*stage),
            Self::ModelLoadFailure { .. } | Self::InvalidConfig(_) => None,
        }
    }
}

/// 分割流水线结果.
pub type SegResult<T> = Result<T, SegError>;
