//! 模型接口与权重定位.
//!
//! 网络本身 (结构, 权重格式, 运行时) 对本 crate 不透明. 调用者通过实现
//! [`SegmentationModel`] 接入任意推理后端, 通过 [`ModelLoader`] 从
//! [`WeightStore`] 定位到的权重文件构建模型.

use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::{Array5, ArrayView5};

use crate::consts::{MODEL_DIR_ENV, MODEL_DIR_NAME, WEIGHTS_FILE_NAME};
use crate::{SegError, SegResult};

/// 模型或加载器抛出的任意错误.
pub type ModelError = Box<dyn Error + Send + Sync>;

/// 预训练三维分割网络.
///
/// # 约定
///
/// 1. 输入形状为 `[B, C, X, Y, Z]`, 输出形状必须为 `[B, K, X, Y, Z]`, `K` 为类别数.
/// 2. 输出为未经激活的类别得分 (logits).
/// 3. 同一权重下必须是确定性的, 且没有副作用.
pub trait SegmentationModel {
    /// 对一批窗口进行预测.
    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>;
}

impl<F> SegmentationModel for F
where
    F: Fn(ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>,
{
    #[inline]
    fn predict(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        self(batch)
    }
}

/// 从权重文件构建模型.
pub trait ModelLoader {
    /// 构建出的模型.
    type Model: SegmentationModel;

    /// 读取 `weights` 并构建模型. 权重损坏或与网络结构不匹配时返回 `Err`.
    fn load(&self, weights: &Path) -> Result<Self::Model, ModelError>;
}

/// 本地权重目录.
///
/// 该结构只负责定位和检查本地文件, 不做任何下载.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightStore {
    dir: PathBuf,
    file_name: String,
}

impl WeightStore {
    /// 使用目录 `dir` 和默认权重文件名.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            file_name: WEIGHTS_FILE_NAME.to_string(),
        }
    }

    /// 替换权重文件名.
    pub fn with_file_name<S: Into<String>>(mut self, name: S) -> Self {
        self.file_name = name.into();
        self
    }

    /// 获取权重目录.
    ///
    /// 1. 若环境变量 `$LESION_SEG_MODEL_DIR` 非空, 则使用其值;
    /// 2. 否则, 使用 `{用户主目录}/.lesion_segmentor`.
    ///
    /// 两者都无法确定时返回 `None`.
    pub fn from_env_or_home() -> Option<Self> {
        match env::var_os(MODEL_DIR_ENV) {
            Some(d) if !d.is_empty() => Some(Self::new(d)),
            _ => {
                let mut dir = dirs::home_dir()?;
                dir.push(MODEL_DIR_NAME);
                Some(Self::new(dir))
            }
        }
    }

    /// 权重目录.
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 权重文件的完整路径. 不检查文件是否存在.
    #[inline]
    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// 确认权重文件存在且非空, 返回其路径.
    pub fn locate(&self) -> SegResult<PathBuf> {
        let path = self.weights_path();
        let fail = |reason: String| SegError::ModelLoadFailure {
            path: path.clone(),
            source: reason.into(),
        };
        let meta = fs::metadata(&path).map_err(|e| fail(format!("weights not available: {e}")))?;
        if !meta.is_file() {
            return Err(fail("weights path is not a regular file".to_string()));
        }
        if meta.len() == 0 {
            return Err(fail("weights file is empty".to_string()));
        }
        Ok(path)
    }

    /// 定位权重并交给 `loader` 构建模型.
    pub fn load_with<L: ModelLoader>(&self, loader: &L) -> SegResult<L::Model> {
        let path = self.locate()?;
        let model = loader
            .load(&path)
            .map_err(|source| SegError::ModelLoadFailure {
                path: path.clone(),
                source,
            })?;
        info!("model loaded from `{}`", path.display());
        Ok(model)
    }
}
