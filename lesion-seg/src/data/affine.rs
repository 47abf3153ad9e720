//! 体素索引到物理坐标的 4x4 仿射变换.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector4};
use nifti::NiftiHeader;

use crate::consts::AFFINE_TOL;
use crate::data::Orientation;

/// 4x4 仿射矩阵, 将体素索引 `(i, j, k)` 映射到物理 (扫描仪) 坐标, 单位为毫米.
///
/// 该结构是只读的. 所有变换都返回新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Affine(Matrix4<f64>);

impl Default for Affine {
    #[inline]
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Affine {
    type Output = Affine;

    /// 矩阵乘法 `self * rhs`, 即先作用 `rhs` 再作用 `self`.
    #[inline]
    fn mul(self, rhs: Affine) -> Affine {
        Affine(self.0 * rhs.0)
    }
}

impl Affine {
    /// 单位仿射.
    #[inline]
    pub fn identity() -> Self {
        Self(Matrix4::identity())
    }

    /// 直接由矩阵构建. 调用者负责保证最后一行为 `[0, 0, 0, 1]`.
    #[inline]
    pub fn from_matrix(m: Matrix4<f64>) -> Self {
        Self(m)
    }

    /// 按行给出前三行构建.
    pub fn from_rows(rows: [[f64; 4]; 3]) -> Self {
        let [x, y, z] = rows;
        Self(Matrix4::new(
            x[0], x[1], x[2], x[3], //
            y[0], y[1], y[2], y[3], //
            z[0], z[1], z[2], z[3], //
            0.0, 0.0, 0.0, 1.0,
        ))
    }

    /// 轴对齐仿射: 对角线为 `spacing`, 平移为 `origin`.
    pub fn from_spacing(spacing: [f64; 3], origin: [f64; 3]) -> Self {
        let [sx, sy, sz] = spacing;
        let [ox, oy, oz] = origin;
        Self::from_rows([
            [sx, 0.0, 0.0, ox],
            [0.0, sy, 0.0, oy],
            [0.0, 0.0, sz, oz],
        ])
    }

    /// 从 nifti header 中解析仿射矩阵.
    ///
    /// 优先级依次为: `sform_code > 0` 时的 sform, `qform_code > 0` 时的 qform 四元数,
    /// 最后退化为由 `pixdim` 构成的对角矩阵.
    pub fn from_header(h: &NiftiHeader) -> Self {
        if h.sform_code > 0 {
            let row = |r: &[f32; 4]| [r[0] as f64, r[1] as f64, r[2] as f64, r[3] as f64];
            Self::from_rows([row(&h.srow_x), row(&h.srow_y), row(&h.srow_z)])
        } else if h.qform_code > 0 {
            Self::from_qform(h)
        } else {
            let [_, x, y, z, ..] = h.pixdim;
            Self::from_spacing([x.abs() as f64, y.abs() as f64, z.abs() as f64], [0.0; 3])
        }
    }

    /// 由 qform 四元数, `pixdim` 和 `qoffset` 构建.
    #[allow(clippy::many_single_char_names)]
    fn from_qform(h: &NiftiHeader) -> Self {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();

        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let [i, j, k] = [
            h.pixdim[1].abs() as f64,
            h.pixdim[2].abs() as f64,
            h.pixdim[3].abs() as f64 * qfac,
        ];
        let (qx, qy, qz) = (h.quatern_x as f64, h.quatern_y as f64, h.quatern_z as f64);

        Self::from_rows([
            [
                (a * a + b * b - c * c - d * d) * i,
                2.0 * (b * c - a * d) * j,
                2.0 * (b * d + a * c) * k,
                qx,
            ],
            [
                2.0 * (b * c + a * d) * i,
                (a * a + c * c - b * b - d * d) * j,
                2.0 * (c * d - a * b) * k,
                qy,
            ],
            [
                2.0 * (b * d - a * c) * i,
                2.0 * (c * d + a * b) * j,
                (a * a + d * d - c * c - b * b) * k,
                qz,
            ],
        ])
    }

    /// 将仿射矩阵写入 `h`: 同时改写 sform, qform 和 `pixdim[0..4]`.
    ///
    /// 其它字段保持不变. 若原 header 的 form code 为 0, 则写为 1 (scanner anat).
    pub fn write_to_header(&self, h: &mut NiftiHeader) {
        let m = &self.0;
        let row = |r: usize| [m[(r, 0)] as f32, m[(r, 1)] as f32, m[(r, 2)] as f32, m[(r, 3)] as f32];
        h.srow_x = row(0);
        h.srow_y = row(1);
        h.srow_z = row(2);
        h.sform_code = h.sform_code.max(1);

        let zooms = self.spacing();
        let mut r = self.linear();
        for (col, zoom) in zooms.iter().enumerate() {
            if *zoom > 0.0 {
                for row in 0..3 {
                    r[(row, col)] /= zoom;
                }
            }
        }
        // 左手系时翻转第三列, 并用 qfac = -1 记录.
        let qfac = if r.determinant() < 0.0 {
            for row in 0..3 {
                r[(row, 2)] = -r[(row, 2)];
            }
            -1.0
        } else {
            1.0
        };
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&r));
        // coords 顺序为 (i, j, k, w). nifti 约定 a = w >= 0.
        let coords = q.quaternion().coords;
        let sign = if coords[3] < 0.0 { -1.0 } else { 1.0 };
        h.quatern_b = (coords[0] * sign) as f32;
        h.quatern_c = (coords[1] * sign) as f32;
        h.quatern_d = (coords[2] * sign) as f32;
        let [tx, ty, tz] = self.translation();
        (h.quatern_x, h.quatern_y, h.quatern_z) = (tx as f32, ty as f32, tz as f32);
        h.qform_code = h.qform_code.max(1);

        h.pixdim[0] = qfac;
        for (dst, zoom) in h.pixdim[1..4].iter_mut().zip(zooms) {
            *dst = zoom as f32;
        }
    }

    /// 底层矩阵.
    #[inline]
    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.0
    }

    /// 左上角 3x3 线性部分 (旋转 + 缩放 + 剪切).
    #[inline]
    pub fn linear(&self) -> Matrix3<f64> {
        self.0.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// 平移部分, 即体素 `(0, 0, 0)` 中心的物理坐标.
    #[inline]
    pub fn translation(&self) -> [f64; 3] {
        [self.0[(0, 3)], self.0[(1, 3)], self.0[(2, 3)]]
    }

    /// 体素间距: 线性部分每一列的模长.
    pub fn spacing(&self) -> [f64; 3] {
        let m = &self.0;
        let norm = |c: usize| (m[(0, c)].powi(2) + m[(1, c)].powi(2) + m[(2, c)].powi(2)).sqrt();
        [norm(0), norm(1), norm(2)]
    }

    /// 单个体素的物理体积, 以立方毫米为单位.
    #[inline]
    pub fn voxel_volume(&self) -> f64 {
        self.linear().determinant().abs()
    }

    /// 与该仿射最接近的轴向编码.
    #[inline]
    pub fn orientation(&self) -> Orientation {
        Orientation::from_affine(self)
    }

    /// 逆变换. 矩阵奇异时返回 `None`.
    #[inline]
    pub fn inverse(&self) -> Option<Affine> {
        self.0.try_inverse().map(Affine)
    }

    /// 将体素坐标 (可为非整数) 映射到物理坐标.
    #[inline]
    pub fn apply(&self, [i, j, k]: [f64; 3]) -> [f64; 3] {
        let v = self.0 * Vector4::new(i, j, k, 1.0);
        [v[0], v[1], v[2]]
    }

    /// 保持方向和平移不变, 将每个体素轴的间距改为 `spacing`.
    pub fn with_spacing(&self, spacing: [f64; 3]) -> Affine {
        let current = self.spacing();
        let mut m = self.0;
        for col in 0..3 {
            let scale = if current[col] > 0.0 {
                spacing[col] / current[col]
            } else {
                1.0
            };
            for row in 0..3 {
                m[(row, col)] *= scale;
            }
        }
        Affine(m)
    }

    /// 替换平移部分.
    pub fn with_translation(&self, [x, y, z]: [f64; 3]) -> Affine {
        let mut m = self.0;
        (m[(0, 3)], m[(1, 3)], m[(2, 3)]) = (x, y, z);
        Affine(m)
    }

    /// 逐元素近似相等.
    pub fn approx_eq(&self, other: &Affine, tol: f64) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs())))
    }

    /// 使用默认容差 [`AFFINE_TOL`] 近似比较.
    #[inline]
    pub fn close_to(&self, other: &Affine) -> bool {
        self.approx_eq(other, AFFINE_TOL)
    }
}
