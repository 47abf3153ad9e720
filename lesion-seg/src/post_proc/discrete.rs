//! 类别得分的激活与离散化.

use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};

use crate::{SegError, SegResult, Stage};

/// 沿类别维 (第 0 维) 原地做 softmax.
///
/// 每个体素先减去该体素的最大得分, 因此大得分不会溢出.
/// 任一得分不是有限值时返回 [`SegError::InternalConsistency`].
pub fn softmax(scores: &mut Array4<f32>) -> SegResult<()> {
    if let Some(bad) = scores.iter().find(|v| !v.is_finite()) {
        return Err(SegError::InternalConsistency {
            stage: Stage::Activation,
            detail: format!("non-finite class score {bad}"),
        });
    }

    let op = |mut lane: ndarray::ArrayViewMut1<'_, f32>| {
        let max = lane.fold(f32::NEG_INFINITY, |m, v| m.max(*v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    };
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            Zip::from(scores.lanes_mut(Axis(0))).par_for_each(op);
        } else {
            Zip::from(scores.lanes_mut(Axis(0))).for_each(op);
        }
    }
    Ok(())
}

/// 逐体素取概率最大的类别下标. 最大值相同时取下标较小者.
///
/// 类别数为 0 或超过 `u8` 表示范围时返回 [`SegError::UnexpectedOutputShape`].
pub fn argmax(probs: ArrayView4<'_, f32>) -> SegResult<Array3<u8>> {
    let (classes, ni, nj, nk) = probs.dim();
    if classes == 0 || classes > u8::MAX as usize + 1 {
        return Err(SegError::shape(Stage::Discretize, &[2, ni, nj, nk], probs.shape()));
    }

    let mut out = Array3::<u8>::zeros((ni, nj, nk));
    let op = |o: &mut u8, lane: ndarray::ArrayView1<'_, f32>| {
        let mut best = 0;
        for (c, v) in lane.iter().enumerate().skip(1) {
            if *v > lane[best] {
                best = c;
            }
        }
        *o = best as u8;
    };
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            Zip::from(&mut out).and(probs.lanes(Axis(0))).par_for_each(op);
        } else {
            Zip::from(&mut out).and(probs.lanes(Axis(0))).for_each(op);
        }
    }
    Ok(out)
}

/// 把类别下标 `j` 替换为 `values[j]`.
///
/// 出现 `values` 之外的下标时返回 [`SegError::InternalConsistency`].
pub fn remap_labels(labels: &mut Array3<u8>, values: &[u8]) -> SegResult<()> {
    if values.iter().enumerate().all(|(j, v)| j == *v as usize) {
        // 恒等映射只需检查范围.
        return match labels.iter().find(|c| **c as usize >= values.len()) {
            Some(c) => Err(unknown_class(*c, values.len())),
            None => Ok(()),
        };
    }
    for c in labels.iter_mut() {
        *c = *values
            .get(*c as usize)
            .ok_or_else(|| unknown_class(*c, values.len()))?;
    }
    Ok(())
}

fn unknown_class(c: u8, n: usize) -> SegError {
    SegError::InternalConsistency {
        stage: Stage::Discretize,
        detail: format!("class index {c} has no label value ({n} configured)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut s = Array4::from_shape_fn((3, 2, 2, 2), |(c, i, j, k)| {
            (c as f32 - 1.0) * (i + j + k) as f32 * 40.0
        });
        softmax(&mut s).unwrap();
        for lane in s.lanes(Axis(0)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
            assert!(lane.iter().all(|p| (0.0..=1.0).contains(p)));
        }
        // 全零得分得到均匀分布.
        assert!((s[(0, 0, 0, 0)] - 1.0 / 3.0).abs() < 1e-6);
        // 大得分不溢出.
        assert!((s[(2, 1, 1, 1)] - 1.0).abs() < 1e-6);

        let mut bad = Array4::from_elem((2, 1, 1, 1), f32::NAN);
        let e = softmax(&mut bad).unwrap_err();
        assert_eq!(e.stage(), Some(Stage::Activation));
    }

    #[test]
    fn test_argmax_ties_to_lowest() {
        let mut p = Array4::<f32>::zeros((3, 1, 1, 3));
        p[(1, 0, 0, 0)] = 0.9;
        p[(0, 0, 0, 1)] = 0.4;
        p[(2, 0, 0, 1)] = 0.4;
        p[(1, 0, 0, 2)] = 0.5;
        p[(2, 0, 0, 2)] = 0.5;
        let l = argmax(p.view()).unwrap();
        assert_eq!(l.into_raw_vec(), vec![1, 0, 1]);

        let empty = Array4::<f32>::zeros((0, 1, 1, 1));
        assert!(matches!(
            argmax(empty.view()),
            Err(SegError::UnexpectedOutputShape { stage: Stage::Discretize, .. })
        ));
    }

    /// 把标签编码为 `classes` 个通道的 one-hot 得分.
    fn one_hot(labels: &Array3<u8>, classes: usize) -> Array4<f32> {
        let (i, j, k) = labels.dim();
        Array4::from_shape_fn((classes, i, j, k), |(c, a, b, d)| {
            (labels[(a, b, d)] as usize == c) as u8 as f32
        })
    }

    #[test]
    fn test_discretize_is_idempotent() {
        let labels = Array3::from_shape_fn((4, 3, 5), |(i, j, k)| ((i * 7 + j * 3 + k) % 3) as u8);
        let first = argmax(one_hot(&labels, 3).view()).unwrap();
        assert_eq!(first, labels);

        let second = argmax(one_hot(&first, 3).view()).unwrap();
        assert_eq!(second, first);

        // softmax 不改变 one-hot 得分的 argmax.
        let mut probs = one_hot(&first, 3);
        softmax(&mut probs).unwrap();
        assert_eq!(argmax(probs.view()).unwrap(), first);
    }

    #[test]
    fn test_remap() {
        let mut l = Array3::from_shape_vec((1, 1, 3), vec![0u8, 1, 2]).unwrap();
        remap_labels(&mut l, &[0, 1, 2]).unwrap();
        assert_eq!(l.as_slice().unwrap(), &[0, 1, 2]);
        remap_labels(&mut l, &[0, 255, 7]).unwrap();
        assert_eq!(l.as_slice().unwrap(), &[0, 255, 7]);

        let mut l = Array3::from_elem((1, 1, 1), 2u8);
        assert!(remap_labels(&mut l, &[0, 1]).is_err());
    }
}
