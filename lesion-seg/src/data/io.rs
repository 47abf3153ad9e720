//! nii / nii.gz 读写.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{ArrayD, ArrayView3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::data::{Affine, SpatialAttr};
use crate::{SegError, SegResult, Shape3d, Stage};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
pub(crate) type BoxedHeader = Box<NiftiHeader>;

/// 从磁盘读入的体数据: 原始数组, 解析后的仿射矩阵, 以及原样保留的 header.
///
/// 数组按 nifti 惯例以 `[i, j, k]` 或 `[i, j, k, t]` 组织, 强度已按
/// `scl_slope` / `scl_inter` 换算.
#[derive(Debug, Clone)]
pub struct NiftiImage {
    data: ArrayD<f32>,
    affine: Affine,
    header: BoxedHeader,
}

impl SpatialAttr for NiftiImage {
    #[inline]
    fn affine(&self) -> Affine {
        self.affine
    }

    #[inline]
    fn shape(&self) -> Shape3d {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }
}

impl NiftiImage {
    /// 打开 nii 文件格式的体数据. `path` 为 nii 或 nii.gz 文件的本地路径.
    ///
    /// 文件不存在或无法解析时返回 [`SegError::InputNotFound`],
    /// 维数不足三维时返回 [`SegError::GeometryInconsistency`].
    pub fn load<P: AsRef<Path>>(path: P) -> SegResult<Self> {
        let path = path.as_ref();
        let not_found = |reason: String| SegError::InputNotFound {
            stage: Stage::Load,
            path: path.to_path_buf(),
            reason,
        };
        if !path.is_file() {
            return Err(not_found("no such file".to_string()));
        }

        let obj = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| not_found(e.to_string()))?;
        let header = Box::new(obj.header().clone());
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| not_found(e.to_string()))?;

        let ans = Self::from_parts(data, header)?;
        info!(
            "loaded `{}`: shape {:?}, spacing {:?}, axis codes {}",
            path.display(),
            ans.data.shape(),
            ans.spacing(),
            ans.orientation()
        );
        Ok(ans)
    }

    /// 由数组和 header 构建, 仿射矩阵从 header 解析.
    pub fn from_parts(data: ArrayD<f32>, header: BoxedHeader) -> SegResult<Self> {
        if data.ndim() < 3 {
            return Err(SegError::geometry(
                Stage::Load,
                format!("expected a 3-D or 4-D volume, got shape {:?}", data.shape()),
            ));
        }
        if data.shape().contains(&0) {
            return Err(SegError::geometry(
                Stage::Load,
                format!("empty axis in shape {:?}", data.shape()),
            ));
        }
        let affine = Affine::from_header(&header);
        Ok(Self {
            data: data.as_standard_layout().into_owned(),
            affine,
            header,
        })
    }

    /// 由数组和仿射矩阵直接构建, header 使用默认值并写入该仿射.
    pub fn from_array(data: ArrayD<f32>, affine: Affine) -> SegResult<Self> {
        let mut header = Box::<NiftiHeader>::default();
        affine.write_to_header(&mut header);
        if data.ndim() > 7 {
            return Err(SegError::geometry(
                Stage::Load,
                format!("at most 7 dimensions fit a header, got {}", data.ndim()),
            ));
        }
        for (dst, src) in header.dim[1..].iter_mut().zip(data.shape()) {
            *dst = u16::try_from(*src).map_err(|_| {
                SegError::geometry(
                    Stage::Load,
                    format!("axis length {src} does not fit a header, shape {:?}", data.shape()),
                )
            })?;
        }
        header.dim[0] = data.ndim() as u16;
        let mut ans = Self::from_parts(data, header)?;
        ans.affine = affine;
        Ok(ans)
    }

    /// 原始数组的不可变视图.
    #[inline]
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// 原始 header.
    #[inline]
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// 拆分为数组, 仿射和 header.
    #[inline]
    pub fn into_parts(self) -> (ArrayD<f32>, Affine, BoxedHeader) {
        (self.data, self.affine, self.header)
    }
}

/// 由 `reference` 派生输出 header: 几何字段由 `affine` 重写, 强度缩放重置为恒等,
/// 其余字段原样保留.
pub fn label_header(reference: &NiftiHeader, affine: &Affine) -> NiftiHeader {
    let mut h = reference.clone();
    affine.write_to_header(&mut h);
    h.scl_slope = 1.0;
    h.scl_inter = 0.0;
    h
}

/// 写出路径 `path` 同目录下的临时文件路径.
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".partial-{name}"))
}

/// 将标签体数据写出为 nii 文件. 文件名以 `.gz` 结尾时自动压缩.
///
/// 数据先写入同目录下的隐藏临时文件, 成功后再重命名为 `path`.
/// 任何失败都会删除临时文件, 因此失败时不会留下不完整的输出.
pub fn save_label<P: AsRef<Path>>(
    path: P,
    labels: ArrayView3<'_, u8>,
    affine: &Affine,
    reference: &NiftiHeader,
) -> SegResult<()> {
    let path = path.as_ref();
    let write_err = |reason: String| SegError::OutputWrite {
        stage: Stage::Save,
        path: path.to_path_buf(),
        reason,
    };
    if path.file_name().is_none() {
        return Err(write_err("output path has no file name".to_string()));
    }

    let header = label_header(reference, affine);
    let tmp = partial_path(path);
    debug!("writing labels to `{}`", tmp.display());

    let written = WriterOptions::new(&tmp)
        .reference_header(&header)
        .write_nifti(&labels)
        .map_err(|e| write_err(e.to_string()))
        .and_then(|_| fs::rename(&tmp, path).map_err(|e| write_err(e.to_string())));

    if written.is_err() {
        // 临时文件可能不存在, 忽略删除失败.
        let _ = fs::remove_file(&tmp);
    } else {
        info!("segmentation written to `{}`", path.display());
    }
    written
}
