//! 可分离高斯平滑.

use ndarray::{Array4, ArrayView1, ArrayViewMut1, Axis, Zip};

use crate::consts::GAUSSIAN_TRUNCATE;

/// 离散高斯核, 长度为 `2 * radius + 1`, 总和为 1.
///
/// 每个权重为连续高斯在 `[x - 0.5, x + 0.5]` 上的积分 (用 `erf` 计算),
/// 半径为 `round(max(sigma * GAUSSIAN_TRUNCATE, 0.5))`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let sigma = sigma.abs();
    let radius = ((sigma * GAUSSIAN_TRUNCATE).max(0.5) + 0.5) as i64;
    let t = std::f64::consts::FRAC_1_SQRT_2 / sigma;
    let raw: Vec<f64> = (-radius..=radius)
        .map(|x| {
            let x = x as f64;
            (0.5 * (libm::erf(t * (x + 0.5)) - libm::erf(t * (x - 0.5)))).max(0.0)
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| (w / total) as f32).collect()
}

/// 一维卷积, 越界部分按 0 填充.
fn convolve_lane(input: ArrayView1<'_, f32>, mut output: ArrayViewMut1<'_, f32>, kernel: &[f32]) {
    let n = input.len() as i64;
    let radius = (kernel.len() / 2) as i64;
    for (x, out) in output.iter_mut().enumerate() {
        let x = x as i64;
        *out = kernel
            .iter()
            .enumerate()
            .filter_map(|(t, w)| {
                let src = x + t as i64 - radius;
                (0..n).contains(&src).then(|| w * input[src as usize])
            })
            .sum();
    }
}

/// 对通道优先数据的三个空间轴依次做高斯平滑. `sigma` 以体素为单位.
pub fn gaussian_smooth(data: &Array4<f32>, sigma: f64) -> Array4<f32> {
    let kernel = gaussian_kernel(sigma);
    let mut src = data.clone();
    let mut dst = Array4::<f32>::zeros(data.raw_dim());

    for axis in 1..=3 {
        let zip = Zip::from(dst.lanes_mut(Axis(axis))).and(src.lanes(Axis(axis)));
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                zip.par_for_each(|o, i| convolve_lane(i, o, &kernel));
            } else {
                zip.for_each(|o, i| convolve_lane(i, o, &kernel));
            }
        }
        std::mem::swap(&mut src, &mut dst);
    }
    src
}
