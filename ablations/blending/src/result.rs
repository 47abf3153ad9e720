//! 实验结果.

use lesion_seg::prelude::*;
use std::io::{self, Write};
use std::time::Duration;

/// 单组设置的运行统计.
#[derive(Clone, Debug)]
pub struct Profile {
    pub lesion_voxels: usize,
    pub lesion_volume_mm3: f64,
    pub dice: f64,
    pub false_positives: usize,
    pub elapsed: Duration,
    pub labels: LabelVolume,
}

impl Profile {
    /// 与 `other` 标签不同的体素个数.
    pub fn differs_from(&self, other: &Profile) -> usize {
        self.labels
            .data()
            .iter()
            .zip(other.labels.data().iter())
            .filter(|(a, b)| a != b)
            .count()
    }
}

/// 将 `p` 的结果写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &SegResult<Profile>, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Profile `{name}`:")?;
    let p = match p {
        Ok(p) => p,
        Err(e) => return write!(w, "{S4}Failed: {e}"),
    };
    writeln!(w, "{S4}Lesion voxels: {}", p.lesion_voxels)?;
    writeln!(w, "{S4}Lesion volume: {:.1} mm3", p.lesion_volume_mm3)?;
    writeln!(w, "{S4}Dice: {:.6}", p.dice)?;
    writeln!(w, "{S4}False positives: {}", p.false_positives)?;
    write!(w, "{S4}Total machine time: {} ms", p.elapsed.as_millis())?;
    Ok(())
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, SegResult<Profile>)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, SegResult<Profile>)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) -> io::Result<()> {
        let mut out = io::stdout().lock();
        utils::sep_to(&mut out)?;
        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut out)?;
            writeln!(out)?;
            utils::sep_to(&mut out)?;
        }

        // 批大小不影响融合结果, 因此所有高斯设置的标签应当完全一致.
        let gaussian: Vec<_> = self
            .data
            .iter()
            .filter(|(k, _)| k.starts_with("gaussian"))
            .filter_map(|(k, p)| p.as_ref().ok().map(|p| (*k, p)))
            .collect();
        if let Some(((base_key, base), rest)) = gaussian.split_first() {
            for (key, p) in rest {
                writeln!(
                    out,
                    "`{key}` vs `{base_key}`: {} voxel(s) differ",
                    p.differs_from(base)
                )?;
            }
        }
        Ok(())
    }
}
