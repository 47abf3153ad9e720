//! 滑窗推理.
//!
//! # 流程
//!
//! 1. 小于 ROI 的轴先做边缘复制填充 ([`Padding`]);
//! 2. 按 [`WindowGrid`] 划分窗口, 每 `batch_size` 个窗口组成一批送入模型;
//! 3. 每个窗口的类别得分乘以融合权重后累加, 最后逐体素除以累加权重;
//! 4. 裁掉填充部分.

pub mod blend;
mod model;
mod sliding;
pub mod window;

pub use model::{ModelError, ModelLoader, SegmentationModel, WeightStore};
pub use sliding::SlidingWindowInferer;
pub use window::{Padding, Window, WindowGrid};
