//! 滑窗划分与边缘填充.

use itertools::Itertools;
use ndarray::{s, Array4, ArrayView4, Ix4, SliceInfo, SliceInfoElem};

use crate::{SegError, SegResult, Shape3d, Stage};

/// 轴对齐子区域, 由起点和大小给出.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    /// 起点 `[i, j, k]`.
    pub start: Shape3d,
    /// 大小 `[i, j, k]`.
    pub size: Shape3d,
}

impl Window {
    /// 终点 (不含).
    #[inline]
    pub fn end(&self) -> Shape3d {
        [0, 1, 2].map(|d| self.start[d] + self.size[d])
    }

    /// 是否包含体素 `pos`?
    #[inline]
    pub fn contains(&self, pos: Shape3d) -> bool {
        let end = self.end();
        (0..3).all(|d| self.start[d] <= pos[d] && pos[d] < end[d])
    }

    /// 通道优先四维数组上对应的切片 (全部通道).
    pub fn slice_info(&self) -> SliceInfo<[SliceInfoElem; 4], Ix4, Ix4> {
        let [a, b, c] = self.start;
        let [x, y, z] = self.end();
        s![.., a..x, b..y, c..z]
    }
}

/// 单轴窗口起点.
///
/// 步长为 `roi * (1 - overlap)` 向下取整 (至少为 1). `roi` 与 `size` 相等时步长为 `roi`.
/// 最后一个窗口贴齐远端边界, 重复的起点会被去除.
pub fn axis_starts(size: usize, roi: usize, overlap: f64) -> Vec<usize> {
    let interval = if roi == size {
        roi
    } else {
        ((roi as f64 * (1.0 - overlap)) as usize).max(1)
    };
    let count = (0..)
        .find(|d| d * interval + roi >= size)
        .map_or(1, |d| d + 1);
    (0..count)
        .map(|d| {
            let start = d * interval;
            start - (start + roi).saturating_sub(size)
        })
        .dedup()
        .collect()
}

/// 覆盖整个体数据的滑窗集合. 窗口按 `i` 最慢, `k` 最快的顺序排列.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowGrid {
    shape: Shape3d,
    roi: Shape3d,
    starts: [Vec<usize>; 3],
}

impl WindowGrid {
    /// 在形状为 `shape` 的体数据上划分大小为 `roi` 的窗口.
    ///
    /// `shape` 的每一维都必须不小于 `roi` (先用 [`Padding`] 填充).
    pub fn new(shape: Shape3d, roi: Shape3d, overlap: f64) -> SegResult<Self> {
        if (0..3).any(|d| roi[d] == 0 || roi[d] > shape[d]) {
            return Err(SegError::InternalConsistency {
                stage: Stage::SlidingWindow,
                detail: format!("window {roi:?} does not fit into padded shape {shape:?}"),
            });
        }
        let starts = [0, 1, 2].map(|d| axis_starts(shape[d], roi[d], overlap));
        Ok(Self { shape, roi, starts })
    }

    /// 体数据形状.
    #[inline]
    pub fn shape(&self) -> Shape3d {
        self.shape
    }

    /// 每个轴上的窗口起点.
    #[inline]
    pub fn starts(&self) -> &[Vec<usize>; 3] {
        &self.starts
    }

    /// 窗口总数.
    #[inline]
    pub fn len(&self) -> usize {
        self.starts.iter().map(Vec::len).product()
    }

    /// 是否没有任何窗口? 合法构造的网格总是非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按固定顺序迭代所有窗口.
    pub fn iter(&self) -> impl Iterator<Item = Window> + '_ {
        let roi = self.roi;
        itertools::iproduct!(
            self.starts[0].iter(),
            self.starts[1].iter(),
            self.starts[2].iter()
        )
        .map(move |(i, j, k)| Window {
            start: [*i, *j, *k],
            size: roi,
        })
    }
}

/// 将小于 ROI 的轴填充到 ROI 大小. 两侧填充量为 `before = diff / 2`, `after = diff - before`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Padding {
    before: Shape3d,
    after: Shape3d,
}

impl Padding {
    /// 计算形状为 `shape` 的体数据所需的填充.
    pub fn for_roi(shape: Shape3d, roi: Shape3d) -> Self {
        let diff = [0, 1, 2].map(|d| roi[d].saturating_sub(shape[d]));
        let before = diff.map(|x| x / 2);
        let after = [0, 1, 2].map(|d| diff[d] - before[d]);
        Self { before, after }
    }

    /// 每个轴起始侧的填充量.
    #[inline]
    pub fn before(&self) -> Shape3d {
        self.before
    }

    /// 每个轴末尾侧的填充量.
    #[inline]
    pub fn after(&self) -> Shape3d {
        self.after
    }

    /// 是否无需填充?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.before == [0; 3] && self.after == [0; 3]
    }

    /// 填充后的形状.
    #[inline]
    pub fn padded_shape(&self, shape: Shape3d) -> Shape3d {
        [0, 1, 2].map(|d| shape[d] + self.before[d] + self.after[d])
    }

    /// 边缘复制填充.
    pub fn pad(&self, data: ArrayView4<'_, f32>) -> Array4<f32> {
        let (c, ni, nj, nk) = data.dim();
        let [pi, pj, pk] = self.padded_shape([ni, nj, nk]);
        let [bi, bj, bk] = self.before;
        let src = |p: usize, b: usize, n: usize| p.saturating_sub(b).min(n - 1);
        Array4::from_shape_fn((c, pi, pj, pk), |(ch, i, j, k)| {
            data[(ch, src(i, bi, ni), src(j, bj, nj), src(k, bk, nk))]
        })
    }

    /// 去掉填充部分. `shape` 为填充前的空间形状.
    pub fn crop(&self, data: Array4<f32>, shape: Shape3d) -> Array4<f32> {
        if self.is_empty() {
            return data;
        }
        let [bi, bj, bk] = self.before;
        let [ni, nj, nk] = shape;
        data.slice(s![.., bi..bi + ni, bj..bj + nj, bk..bk + nk])
            .to_owned()
    }
}
