//! 通用常量.

/// 标签值.
pub mod label {
    /// 背景体素值.
    pub const BACKGROUND: u8 = 0;

    /// 病灶体素值.
    pub const LESION: u8 = 1;

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, BACKGROUND)
    }

    /// 体素是否是前景 (任意非背景类别)?
    #[inline]
    pub const fn is_foreground(p: u8) -> bool {
        !is_background(p)
    }
}

/// 默认滑窗 ROI 大小.
pub const DEFAULT_ROI_SIZE: [usize; 3] = [120, 120, 120];

/// 默认目标体素间距, 以毫米为单位.
pub const DEFAULT_TARGET_SPACING: [f64; 3] = [0.7, 0.7, 0.7];

/// 默认相邻窗口重叠比例.
pub const DEFAULT_OVERLAP: f64 = 0.4;

/// 默认每次送入模型的窗口个数.
pub const DEFAULT_BATCH_SIZE: usize = 2;

/// 高斯融合权重的 sigma 与 ROI 边长之比.
pub const DEFAULT_SIGMA_SCALE: f64 = 0.125;

/// 预处理高斯平滑的默认 sigma, 以体素为单位.
pub const DEFAULT_SMOOTHING_SIGMA: f64 = 0.4;

/// 高斯核截断倍数. 核半径为 `round(max(sigma * GAUSSIAN_TRUNCATE, 0.5))`.
pub const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// 融合权重下限. 保证窗口内每个体素都有严格为正的贡献.
pub const MIN_IMPORTANCE: f32 = 1e-3;

/// 仿射矩阵比较容差.
pub const AFFINE_TOL: f64 = 1e-4;

/// 预训练权重文件名.
pub const WEIGHTS_FILE_NAME: &str = "segresnet_lesion.pt";

/// 权重目录环境变量名.
pub const MODEL_DIR_ENV: &str = "LESION_SEG_MODEL_DIR";

/// 用户主目录下的默认权重目录名.
pub const MODEL_DIR_NAME: &str = ".lesion_segmentor";
