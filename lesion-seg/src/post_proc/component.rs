//! 最大连通域过滤.

use std::collections::VecDeque;

use ndarray::{Array3, ArrayView3};

use crate::config::Connectivity;
use crate::consts::label;
use crate::Idx3d;

impl Connectivity {
    /// 邻域偏移量.
    pub fn offsets(&self) -> Vec<[isize; 3]> {
        itertools::iproduct!(-1isize..=1, -1isize..=1, -1isize..=1)
            .map(|(a, b, c)| [a, b, c])
            .filter(|o| {
                let n = o.iter().filter(|v| **v != 0).count();
                match self {
                    Connectivity::Face => n == 1,
                    Connectivity::Full => n >= 1,
                }
            })
            .collect()
    }
}

/// 按 `connectivity` 规则获取所有满足谓词 `pred` 的连通区域.
///
/// 区域按其第一个体素的行优先顺序排列, 区域内体素按 BFS 顺序排列.
pub fn regions(
    data: ArrayView3<'_, u8>,
    connectivity: Connectivity,
    pred: impl Fn(u8) -> bool,
) -> Vec<Vec<Idx3d>> {
    let (ni, nj, nk) = data.dim();
    let offsets = connectivity.offsets();
    let mut visited = Array3::<bool>::default((ni, nj, nk));
    let mut bfs_q: VecDeque<Idx3d> = VecDeque::with_capacity(64);
    let mut ans = Vec::new();

    for (pos, &v) in data.indexed_iter() {
        if visited[pos] || !pred(v) {
            continue;
        }
        visited[pos] = true;
        bfs_q.push_back(pos);
        let mut area = Vec::with_capacity(1);
        while let Some(cur) = bfs_q.pop_front() {
            area.push(cur);
            let (i, j, k) = cur;
            for [di, dj, dk] in offsets.iter() {
                let next = (
                    i.wrapping_add_signed(*di),
                    j.wrapping_add_signed(*dj),
                    k.wrapping_add_signed(*dk),
                );
                if next.0 < ni && next.1 < nj && next.2 < nk && !visited[next] && pred(data[next]) {
                    visited[next] = true;
                    bfs_q.push_back(next);
                }
            }
        }
        ans.push(area);
    }
    ans
}

/// 对每个非背景标签分别只保留其最大连通域, 其余体素置为背景. 返回被清除的体素个数.
///
/// 面积相同的区域中保留行优先顺序最靠前者.
pub fn keep_largest_component(data: &mut Array3<u8>, connectivity: Connectivity) -> usize {
    let mut present = [false; 256];
    for p in data.iter() {
        present[*p as usize] = true;
    }

    let mut removed = 0;
    for value in (0..=u8::MAX).filter(|v| label::is_foreground(*v) && present[*v as usize]) {
        let areas = regions(data.view(), connectivity, |p| p == value);
        let Some(keep) = areas
            .iter()
            .enumerate()
            .max_by(|(a, x), (b, y)| x.len().cmp(&y.len()).then(b.cmp(a)))
            .map(|(i, _)| i)
        else {
            continue;
        };
        for (_, area) in areas.iter().enumerate().filter(|(i, _)| *i != keep) {
            for pos in area.iter() {
                data[*pos] = label::BACKGROUND;
            }
            removed += area.len();
        }
    }
    removed
}
