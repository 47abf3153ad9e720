//! 程序运行函数.

use crate::model::BorderDegraded;
use crate::result::{AblationResult, Profile};
use lesion_seg::prelude::*;
use std::thread;
use std::time::Instant;
use utils::phantom::{self, Phantom};

/// 单组实验设置.
#[derive(Copy, Clone, Debug)]
struct Setting {
    name: &'static str,
    mode: BlendMode,
    batch_size: usize,
}

const SETTINGS: [Setting; 4] = [
    Setting {
        name: "uniform/batch=1",
        mode: BlendMode::Uniform,
        batch_size: 1,
    },
    Setting {
        name: "gaussian/batch=1",
        mode: BlendMode::Gaussian,
        batch_size: 1,
    },
    Setting {
        name: "gaussian/batch=2",
        mode: BlendMode::Gaussian,
        batch_size: 2,
    },
    Setting {
        name: "gaussian/batch=8",
        mode: BlendMode::Gaussian,
        batch_size: 8,
    },
];

/// 在 `phantom` 上运行一组设置.
fn profile(p: &Phantom, truth: &LabelVolume, s: Setting) -> SegResult<Profile> {
    let config = SegConfig::default()
        .with_roi_size([48, 48, 48])
        .with_blend_mode(s.mode)
        .with_batch_size(s.batch_size);
    let model = BorderDegraded { border_bias: 60.0 };
    let seg = LesionSegmentor::new(model, config)?;

    let start = Instant::now();
    let ans = seg.segment(p.image()?)?;
    let elapsed = start.elapsed();

    let pred = ans.labels().data();
    Ok(Profile {
        lesion_voxels: ans.lesion_voxels(),
        lesion_volume_mm3: ans.lesion_volume_mm3(),
        dice: phantom::dice(pred, truth.data()),
        false_positives: phantom::false_positives(pred, truth.data()),
        elapsed,
        labels: ans.into_labels(),
    })
}

/// 实际运行.
pub fn run() -> AblationResult {
    let p = Phantom::new([72, 80, 64]);
    let truth = p.ground_truth();
    println!(
        "Phantom {:?}, {} lesion voxels, {} worker threads",
        p.shape,
        truth.foreground_voxels(),
        utils::cpus().min(SETTINGS.len())
    );

    println!("Running ablation studies...");
    thread::scope(|s| {
        let (p, truth) = (&p, &truth);
        let handles = SETTINGS.map(|setting| s.spawn(move || profile(p, truth, setting)));

        AblationResult::from_iter(
            SETTINGS.iter().map(|x| x.name).zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}
