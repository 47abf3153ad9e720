//! 消融实验依赖的通用组件.

use std::io;

pub mod phantom;

const SEP: &str = "--------------------------------------------------------";

/// 向 `w` 写入简单分隔线.
#[inline]
pub fn sep_to<W: io::Write>(mut w: W) -> io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}
