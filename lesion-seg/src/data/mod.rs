use std::ops::{Index, IndexMut};

use ndarray::{Array3, Array4, ArrayView, ArrayView3, ArrayViewMut, Axis, Ix3, Ix4};

use crate::consts::label;
use crate::{Idx3d, Shape3d};

pub mod affine;
pub mod io;
pub mod orientation;
pub mod tracker;

pub use affine::Affine;
pub use io::NiftiImage;
pub use orientation::{AxisCode, AxisTransform, Orientation};
pub use tracker::{Field, GeometryTracker, SpatialMeta};

/// 带仿射矩阵的体数据的共用属性和部分通用操作.
pub trait SpatialAttr {
    /// 获取体素到物理坐标的仿射矩阵.
    fn affine(&self) -> Affine;

    /// 获取空间形状 `[i, j, k]`.
    fn shape(&self) -> Shape3d;

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        self.shape().iter().product()
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (i0, j0, k0): &Idx3d) -> bool {
        let [i, j, k] = self.shape();
        *i0 < i && *j0 < j && *k0 < k
    }

    /// 获取单个体素分辨率, 以毫米为单位. 该值由仿射矩阵列向量的模长给出,
    /// 而非 header 中的 `pixdim`.
    #[inline]
    fn spacing(&self) -> [f64; 3] {
        self.affine().spacing()
    }

    /// 获取方向编码.
    #[inline]
    fn orientation(&self) -> Orientation {
        Orientation::from_affine(&self.affine())
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [i, j, k] = self.spacing();
        (i - j).abs() < 1e-6 && (i - k).abs() < 1e-6
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel_volume(&self) -> f64 {
        self.affine().voxel_volume()
    }

    /// 当前几何的快照.
    #[inline]
    fn meta(&self) -> SpatialMeta {
        SpatialMeta::new(self.affine(), self.shape())
    }
}

/// 通道优先的四维强度体数据 `[c, i, j, k]`, 以及其仿射矩阵.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
    affine: Affine,
}

impl SpatialAttr for Volume {
    #[inline]
    fn affine(&self) -> Affine {
        self.affine
    }

    #[inline]
    fn shape(&self) -> Shape3d {
        let (_, i, j, k) = self.data.dim();
        [i, j, k]
    }
}

impl Volume {
    /// 直接创建.
    #[inline]
    pub fn new(data: Array4<f32>, affine: Affine) -> Self {
        Self { data, affine }
    }

    /// 由单通道三维数组创建.
    #[inline]
    pub fn from_scalar(data: Array3<f32>, affine: Affine) -> Self {
        Self::new(data.insert_axis(Axis(0)), affine)
    }

    /// 通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix4> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix4> {
        self.data.view_mut()
    }

    /// 获取第 `c` 个通道. 越界时 panic.
    #[inline]
    pub fn channel(&self, c: usize) -> ArrayView<'_, f32, Ix3> {
        self.data.index_axis(Axis(0), c)
    }

    /// 拆分为数组和仿射.
    #[inline]
    pub fn into_parts(self) -> (Array4<f32>, Affine) {
        (self.data, self.affine)
    }
}

/// 三维离散标签体数据, 以及其仿射矩阵. 标签值以 `u8` 保存.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVolume {
    data: Array3<u8>,
    affine: Affine,
}

impl SpatialAttr for LabelVolume {
    #[inline]
    fn affine(&self) -> Affine {
        self.affine
    }

    #[inline]
    fn shape(&self) -> Shape3d {
        let (i, j, k) = self.data.dim();
        [i, j, k]
    }
}

impl Index<Idx3d> for LabelVolume {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for LabelVolume {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl LabelVolume {
    /// 直接创建.
    #[inline]
    pub fn new(data: Array3<u8>, affine: Affine) -> Self {
        Self { data, affine }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, u8, Ix3> {
        self.data.view_mut()
    }

    /// 拆分为数组和仿射.
    #[inline]
    pub fn into_parts(self) -> (Array3<u8>, Affine) {
        (self.data, self.affine)
    }

    /// 获取值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 获取前景 (任意非背景标签) 体素个数.
    #[inline]
    pub fn foreground_voxels(&self) -> usize {
        self.data.iter().filter(|p| label::is_foreground(**p)).count()
    }

    /// 获取前景总体积, 以立方毫米为单位.
    #[inline]
    pub fn foreground_volume_mm3(&self) -> f64 {
        self.foreground_voxels() as f64 * self.voxel_volume()
    }

    /// 收集值为 `label` 的所有体素下标, 结果按行优先存储.
    pub fn positions_of(&self, label: u8) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, p)| (*p == label).then_some(pos))
            .collect()
    }

    /// 前景体素的轴对齐包围盒 `(min, max)`, 闭区间. 全为背景时返回 `None`.
    pub fn foreground_bbox(&self) -> Option<(Idx3d, Idx3d)> {
        let mut it = self
            .data
            .indexed_iter()
            .filter(|(_, p)| label::is_foreground(**p))
            .map(|(pos, _)| pos);
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), (i, j, k)| {
            (
                (lo.0.min(i), lo.1.min(j), lo.2.min(k)),
                (hi.0.max(i), hi.1.max(j), hi.2.max(k)),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_statistics() {
        let mut data = Array3::<u8>::zeros((4, 5, 6));
        data[(1, 2, 3)] = label::LESION;
        data[(2, 4, 5)] = label::LESION;
        let mut v = LabelVolume::new(data, Affine::from_spacing([0.5, 0.5, 2.0], [0.0; 3]));

        assert_eq!(v.size(), 120);
        assert!(v.check(&(3, 4, 5)));
        assert!(!v.check(&(4, 0, 0)));
        assert!(!v.is_isotropic());
        assert_eq!(v.count(label::LESION), 2);
        assert_eq!(v.foreground_voxels(), 2);
        assert!((v.foreground_volume_mm3() - 1.0).abs() < 1e-9);
        assert_eq!(v.foreground_bbox(), Some(((1, 2, 3), (2, 4, 5))));

        v[(1, 2, 3)] = label::BACKGROUND;
        assert_eq!(v.positions_of(label::LESION), vec![(2, 4, 5)]);
    }

    #[test]
    fn test_volume_channels() {
        let v = Volume::from_scalar(Array3::zeros((3, 4, 5)), Affine::identity());
        assert_eq!(v.channels(), 1);
        assert_eq!(v.shape(), [3, 4, 5]);
        assert_eq!(v.meta().shape, [3, 4, 5]);
        assert_eq!(v.orientation(), Orientation::RAS);
    }
}
