#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 基于预训练三维卷积网络, 对 FLAIR 序列脑 MRI 体数据进行二值病灶分割.
//!
//! 网络本身对该 crate 不透明 (见 [`SegmentationModel`]), 本 crate 负责网络之外的全部推理流程:
//! 几何与强度预处理, 带重叠融合的滑窗推理, 以及把预测结果映射回输入原始网格并保留空间元信息.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 流水线一次只处理一个体数据, 且全程同步. 不同体数据之间不共享可变状态.
//! 2. 任何阶段检测到几何不一致都会直接返回 `Err`, 不会带着错误数据继续运行.
//!
//! # 流程
//!
//! ### 读取与几何记录 ✅
//!
//! 读取 nii / nii.gz, 解析 sform / qform 仿射矩阵并记录原始方向编码与形状.
//!
//! 实现位于 `lesion-seg/src/data`.
//!
//! ### 预处理 ✅
//!
//! 依次为: 通道维补齐, 重定向到 RAS, 重采样到目标体素间距 (三线性),
//! 非零体素 z-score 归一化, 高斯平滑, 强度区间线性映射 (截断).
//!
//! 实现位于 `lesion-seg/src/transforms`.
//!
//! ### 滑窗推理 ✅
//!
//! 小于 ROI 的体数据先做边缘复制填充. 窗口按 `ROI * (1 - overlap)` 步长铺满全图,
//! 最后一个窗口贴齐远端边界. 重叠区域按中心高、边缘低的高斯权重融合.
//!
//! 实现位于 `lesion-seg/src/inference`.
//!
//! ### 后处理 ✅
//!
//! softmax -> argmax -> (可选) 最大连通域 -> 最近邻回采样到参考网格
//! -> (可选) 反向重定向 -> 重新附加元信息.
//!
//! 实现位于 `lesion-seg/src/post_proc`.
//!
//! ### 坐标约定
//!
//! 与 nifti 惯例一致, 所有三维数组均按 `[i, j, k]` (即体素索引) 组织,
//! 不做 `[z, H, W]` 转换. 这样仿射矩阵可以直接作用在数组索引上.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 三维空间形状 `[i, j, k]`.
pub type Shape3d = [usize; 3];

/// 体数据, 标签与空间元信息.
pub mod data;

pub mod config;
pub mod consts;
mod error;
pub mod inference;
pub mod post_proc;
pub mod prelude;
mod segmentor;
pub mod transforms;

pub use config::{BlendMode, Connectivity, IntensityRange, SegConfig};
pub use data::{
    Affine, AxisCode, Field, GeometryTracker, LabelVolume, NiftiImage, Orientation, SpatialAttr,
    SpatialMeta, Volume,
};
pub use error::{SegError, SegResult, Stage};
pub use inference::{ModelError, ModelLoader, SegmentationModel, SlidingWindowInferer, WeightStore};
pub use segmentor::{LesionSegmentor, Segmentation};
