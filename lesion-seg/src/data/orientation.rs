//! 解剖学方向编码与轴置换/翻转.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, Axis};

use crate::data::Affine;
use crate::Shape3d;

/// 单个体素轴的解剖学方向编码. 编码表示该轴 **索引增大** 时指向的方向.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AxisCode {
    /// Right, 物理 `+x`.
    R,
    /// Left, 物理 `-x`.
    L,
    /// Anterior, 物理 `+y`.
    A,
    /// Posterior, 物理 `-y`.
    P,
    /// Superior, 物理 `+z`.
    S,
    /// Inferior, 物理 `-z`.
    I,
}

impl AxisCode {
    /// 由物理轴 (0, 1, 2 分别为 x, y, z) 和方向构建.
    #[inline]
    pub const fn new(world_axis: usize, positive: bool) -> Self {
        match (world_axis, positive) {
            (0, true) => AxisCode::R,
            (0, false) => AxisCode::L,
            (1, true) => AxisCode::A,
            (1, false) => AxisCode::P,
            (_, true) => AxisCode::S,
            (_, false) => AxisCode::I,
        }
    }

    /// 对应的物理轴.
    #[inline]
    pub const fn world_axis(&self) -> usize {
        match self {
            AxisCode::R | AxisCode::L => 0,
            AxisCode::A | AxisCode::P => 1,
            AxisCode::S | AxisCode::I => 2,
        }
    }

    /// 是否指向物理轴正方向.
    #[inline]
    pub const fn is_positive(&self) -> bool {
        matches!(self, AxisCode::R | AxisCode::A | AxisCode::S)
    }

    /// 单字母表示.
    #[inline]
    pub const fn as_char(&self) -> char {
        match self {
            AxisCode::R => 'R',
            AxisCode::L => 'L',
            AxisCode::A => 'A',
            AxisCode::P => 'P',
            AxisCode::S => 'S',
            AxisCode::I => 'I',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        Some(match c.to_ascii_uppercase() {
            'R' => AxisCode::R,
            'L' => AxisCode::L,
            'A' => AxisCode::A,
            'P' => AxisCode::P,
            'S' => AxisCode::S,
            'I' => AxisCode::I,
            _ => return None,
        })
    }
}

/// 三个体素轴的方向编码, 例如 `RAS`, `LPS`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Orientation(pub [AxisCode; 3]);

impl Orientation {
    /// 流水线处理空间的标准方向.
    pub const RAS: Orientation = Orientation([AxisCode::R, AxisCode::A, AxisCode::S]);

    /// 由仿射矩阵推断最接近的轴向编码.
    ///
    /// 每一轮在剩余的 (物理轴, 体素轴) 组合中选取归一化方向分量绝对值最大者,
    /// 符号决定正负方向. 值相同时取下标较小者.
    pub fn from_affine(affine: &Affine) -> Self {
        let lin = affine.linear();
        let zooms = affine.spacing();
        let mut weight = [[0.0f64; 3]; 3];
        for (row, w) in weight.iter_mut().enumerate() {
            for (col, v) in w.iter_mut().enumerate() {
                *v = if zooms[col] > 0.0 {
                    lin[(row, col)] / zooms[col]
                } else {
                    0.0
                };
            }
        }

        let mut codes = [None; 3];
        let mut used_world = [false; 3];
        for _ in 0..3 {
            let mut best: Option<(usize, usize, f64)> = None;
            for (row, w) in weight.iter().enumerate().filter(|(r, _)| !used_world[*r]) {
                for (col, v) in w.iter().enumerate().filter(|(c, _)| codes[*c].is_none()) {
                    if best.map_or(true, |(_, _, b)| v.abs() > b.abs()) {
                        best = Some((row, col, *v));
                    }
                }
            }
            // 每一轮都至少剩一行一列, 因此 best 一定存在.
            if let Some((row, col, v)) = best {
                used_world[row] = true;
                codes[col] = Some(AxisCode::new(row, v >= 0.0));
            }
        }
        let [a, b, c] = codes;
        Orientation([
            a.unwrap_or(AxisCode::R),
            b.unwrap_or(AxisCode::A),
            c.unwrap_or(AxisCode::S),
        ])
    }

    /// 获取三个轴编码.
    #[inline]
    pub fn codes(&self) -> [AxisCode; 3] {
        self.0
    }

    /// 三个轴是否恰好覆盖三个不同的物理轴?
    pub fn is_valid(&self) -> bool {
        let mut seen = [false; 3];
        for c in self.0.iter() {
            seen[c.world_axis()] = true;
        }
        seen.iter().all(|s| *s)
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.iter() {
            write!(f, "{}", c.as_char())?;
        }
        Ok(())
    }
}

/// 解析方向编码字符串失败.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseOrientationError(pub String);

impl fmt::Display for ParseOrientationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid axis codes `{}`", self.0)
    }
}

impl std::error::Error for ParseOrientationError {}

impl FromStr for Orientation {
    type Err = ParseOrientationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseOrientationError(s.to_string());
        let codes: Vec<AxisCode> = s.chars().map(AxisCode::from_char).collect::<Option<_>>().ok_or_else(err)?;
        let codes: [AxisCode; 3] = codes.try_into().map_err(|_| err())?;
        let ans = Orientation(codes);
        ans.is_valid().then_some(ans).ok_or_else(err)
    }
}

/// 从一个方向到另一个方向的轴置换与翻转.
///
/// 输出第 `k` 轴取自输入第 `perm[k]` 轴. 若 `flip[k]` 为真, 则该轴同时反向.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AxisTransform {
    perm: [usize; 3],
    flip: [bool; 3],
}

impl AxisTransform {
    /// 计算从 `from` 到 `to` 的变换. 两者都必须合法.
    pub fn between(from: &Orientation, to: &Orientation) -> Self {
        let mut perm = [0, 1, 2];
        let mut flip = [false; 3];
        for (k, target) in to.0.iter().enumerate() {
            if let Some(j) = from.0.iter().position(|c| c.world_axis() == target.world_axis()) {
                perm[k] = j;
                flip[k] = from.0[j].is_positive() != target.is_positive();
            }
        }
        Self { perm, flip }
    }

    /// 是否是恒等变换?
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.perm == [0, 1, 2] && self.flip == [false; 3]
    }

    /// 输入形状为 `shape` 时的输出形状.
    #[inline]
    pub fn output_shape(&self, shape: Shape3d) -> Shape3d {
        self.perm.map(|j| shape[j])
    }

    /// 输出体素索引到输入体素索引的仿射矩阵. `shape` 为输入形状.
    ///
    /// 新的体素到物理坐标仿射即为 `old * self.index_affine(shape)`.
    pub fn index_affine(&self, shape: Shape3d) -> Affine {
        let mut rows = [[0.0; 4]; 3];
        for k in 0..3 {
            let j = self.perm[k];
            if self.flip[k] {
                rows[j][k] = -1.0;
                rows[j][3] = shape[j] as f64 - 1.0;
            } else {
                rows[j][k] = 1.0;
            }
        }
        Affine::from_rows(rows)
    }

    /// 对通道优先的四维数组应用变换.
    pub fn apply(&self, data: &Array4<f32>) -> Array4<f32> {
        let [a, b, c] = self.perm;
        let mut view = data.view().permuted_axes([0, a + 1, b + 1, c + 1]);
        for (k, flip) in self.flip.iter().enumerate() {
            if *flip {
                view.invert_axis(Axis(k + 1));
            }
        }
        view.as_standard_layout().into_owned()
    }

    /// 对三维标签数组应用变换.
    pub fn apply_3d(&self, data: &Array3<u8>) -> Array3<u8> {
        let mut view = data.view().permuted_axes(self.perm);
        for (k, flip) in self.flip.iter().enumerate() {
            if *flip {
                view.invert_axis(Axis(k));
            }
        }
        view.as_standard_layout().into_owned()
    }
}
