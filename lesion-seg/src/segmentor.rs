use std::path::Path;
use std::sync::atomic::AtomicBool;

use log::info;
use nifti::NiftiHeader;

use crate::data::io::{label_header, save_label, BoxedHeader};
use crate::data::{Affine, LabelVolume, NiftiImage, SpatialAttr};
use crate::inference::{ModelLoader, SegmentationModel, SlidingWindowInferer, WeightStore};
use crate::post_proc::PostProcessor;
use crate::transforms::Preprocessor;
use crate::{SegConfig, SegResult, Stage};

/// FLAIR 病灶分割器. 持有模型和配置, 可重复用于任意多个体数据.
///
/// 不同体数据之间不共享任何可变状态; 单个体数据的处理是同步的.
pub struct LesionSegmentor<M> {
    model: M,
    config: SegConfig,
    preprocessor: Preprocessor,
    inferer: SlidingWindowInferer,
    post: PostProcessor,
}

impl<M: SegmentationModel> LesionSegmentor<M> {
    /// 创建. 配置非法时返回 [`crate::SegError::InvalidConfig`].
    pub fn new(model: M, config: SegConfig) -> SegResult<Self> {
        config.validate()?;
        Ok(Self {
            preprocessor: Preprocessor::from_config(&config),
            inferer: SlidingWindowInferer::from_config(&config),
            post: PostProcessor::from_config(&config),
            model,
            config,
        })
    }

    /// 从 `store` 定位权重, 交给 `loader` 构建模型后创建.
    pub fn from_store<L>(store: &WeightStore, loader: &L, config: SegConfig) -> SegResult<Self>
    where
        L: ModelLoader<Model = M>,
    {
        config.validate()?;
        let model = store.load_with(loader)?;
        Self::new(model, config)
    }

    /// 配置.
    #[inline]
    pub fn config(&self) -> &SegConfig {
        &self.config
    }

    /// 模型.
    #[inline]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// 滑窗推理器.
    #[inline]
    pub fn inferer(&self) -> &SlidingWindowInferer {
        &self.inferer
    }

    /// 分割一个已读入内存的体数据.
    #[inline]
    pub fn segment(&self, image: NiftiImage) -> SegResult<Segmentation> {
        self.segment_with_cancel(image, &AtomicBool::new(false))
    }

    /// 同 [`Self::segment`], 但允许在窗口批次之间通过 `cancel` 取消.
    pub fn segment_with_cancel(&self, image: NiftiImage, cancel: &AtomicBool) -> SegResult<Segmentation> {
        let (data, affine, header) = image.into_parts();
        let (volume, mut tracker) = self.preprocessor.run(data, affine)?;

        let scores = self
            .inferer
            .infer_with_cancel(&self.model, volume.data(), cancel)?;
        drop(volume);
        tracker.fork_prediction(Stage::SlidingWindow)?;
        info!("inference done: {} class(es)", scores.shape()[0]);

        let labels = self.post.run(scores, &mut tracker)?;
        Ok(Segmentation { labels, header })
    }

    /// 读取并分割 `input`.
    pub fn segment_file<P: AsRef<Path>>(&self, input: P) -> SegResult<Segmentation> {
        self.segment(NiftiImage::load(input)?)
    }

    /// 读取并分割 `input`, 结果写出到 `output`. 任何失败都不会留下输出文件.
    pub fn segment_to_file<P, Q>(&self, input: P, output: Q) -> SegResult<Segmentation>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let ans = self.segment_file(input)?;
        ans.save(output)?;
        Ok(ans)
    }
}

/// 分割结果: 标签体数据, 以及用于写出的原始 header.
#[derive(Debug, Clone)]
pub struct Segmentation {
    labels: LabelVolume,
    header: BoxedHeader,
}

impl Segmentation {
    /// 标签体数据.
    #[inline]
    pub fn labels(&self) -> &LabelVolume {
        &self.labels
    }

    /// 取出标签体数据.
    #[inline]
    pub fn into_labels(self) -> LabelVolume {
        self.labels
    }

    /// 输出仿射, 即回写完成时记录的仿射.
    #[inline]
    pub fn affine(&self) -> Affine {
        self.labels.affine()
    }

    /// 输出 header: 几何字段来自输出仿射, 其余字段沿用输入.
    pub fn header(&self) -> NiftiHeader {
        label_header(&self.header, &self.affine())
    }

    /// 病灶体素个数.
    #[inline]
    pub fn lesion_voxels(&self) -> usize {
        self.labels.foreground_voxels()
    }

    /// 病灶总体积, 以立方毫米为单位.
    #[inline]
    pub fn lesion_volume_mm3(&self) -> f64 {
        self.labels.foreground_volume_mm3()
    }

    /// 写出为 nii / nii.gz 文件.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> SegResult<()> {
        save_label(path, self.labels.data(), &self.affine(), &self.header)
    }
}

impl From<Segmentation> for LabelVolume {
    #[inline]
    fn from(s: Segmentation) -> Self {
        s.into_labels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::label;
    use crate::inference::ModelError;
    use crate::SegError;
    use crate::{Connectivity, Orientation};
    use itertools::Itertools;
    use ndarray::{Array3, Array5, ArrayD, ArrayView5, Axis};
    use std::cell::Cell;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    type ModelFn = fn(ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>;

    fn init_log() {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Info)
            .init();
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lesion-seg-seg-{}-{name}", std::process::id()))
    }

    /// 预处理后强度高于 `-0.99` 的体素判为病灶.
    fn threshold(x: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let (b, _, i, j, k) = x.dim();
        let mut out = Array5::zeros((b, 2, i, j, k));
        for ((n, _, a, c, d), v) in x.indexed_iter() {
            out[(n, 1, a, c, d)] = (*v + 0.99) * 100.0;
        }
        Ok(out)
    }

    /// 背景 50, 立方体 `[3, 7) x [4, 8) x [2, 6)` 为 200.
    fn phantom() -> Array3<f32> {
        Array3::from_shape_fn((10, 12, 8), |(i, j, k)| {
            if (3..7).contains(&i) && (4..8).contains(&j) && (2..6).contains(&k) {
                200.0
            } else {
                50.0
            }
        })
    }

    fn cube_positions() -> Vec<(usize, usize, usize)> {
        itertools::iproduct!(3..7, 4..8, 2..6).collect()
    }

    fn small_config() -> SegConfig {
        SegConfig::default()
            .with_roi_size([16, 16, 16])
            .with_target_spacing([1.0, 1.0, 1.0])
    }

    #[test]
    fn test_end_to_end_sub_cube() {
        init_log();
        let config = SegConfig::default();
        // 128^3, 1mm -> 0.7mm 得到 182^3, 每个轴上的窗口起点为 [0, 62].
        let (_, grid) = SlidingWindowInferer::from_config(&config)
            .plan([182, 182, 182])
            .unwrap();
        assert_eq!(grid.starts()[0], vec![0, 62]);
        let windows: Vec<_> = grid.iter().collect();

        // 处理网格上的 57..=70 对应原网格上的 40..=49.
        let seen = Cell::new(0usize);
        let stub = |x: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> {
            let (b, c, i, j, k) = x.dim();
            assert_eq!((c, i, j, k), (1, 120, 120, 120));
            // 均匀强度经过归一化与映射后恒为 -1.
            assert!(x.iter().all(|v| (*v + 1.0).abs() < 1e-5));
            let mut out = Array5::zeros((b, 2, i, j, k));
            for (n, mut scores) in out.axis_iter_mut(Axis(0)).enumerate() {
                let start = windows[seen.get() + n].start;
                for ((cls, a, p, q), v) in scores.indexed_iter_mut() {
                    let inside = [a + start[0], p + start[1], q + start[2]]
                        .iter()
                        .all(|g| (57..=70).contains(g));
                    *v = if inside == (cls == 1) { 5.0 } else { 0.0 };
                }
            }
            seen.set(seen.get() + b);
            Ok(out)
        };

        let data = ArrayD::from_elem(ndarray::IxDyn(&[128, 128, 128]), 100.0f32);
        let image = NiftiImage::from_array(data, Affine::identity()).unwrap();
        let seg = LesionSegmentor::new(stub, config).unwrap();
        let ans = seg.segment(image).unwrap();

        assert_eq!(seen.get(), 8);
        assert_eq!(ans.labels().shape(), [128, 128, 128]);
        assert!(ans.affine().close_to(&Affine::identity()));
        assert_eq!(ans.lesion_voxels(), 1000);
        assert!((ans.lesion_volume_mm3() - 1000.0).abs() < 1e-6);
        assert_eq!(ans.labels().foreground_bbox(), Some(((40, 40, 40), (49, 49, 49))));
    }

    #[test]
    fn test_volume_smaller_than_roi() {
        let image = NiftiImage::from_array(phantom().into_dyn(), Affine::identity()).unwrap();
        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        let ans = seg.segment(image).unwrap();
        assert_eq!(ans.labels().shape(), [10, 12, 8]);
        assert_eq!(ans.labels().positions_of(label::LESION), cube_positions());
    }

    #[test]
    fn test_orientation_inversion() {
        // LPS 输入. 不反向时结果处于 RAS 参考网格, i 与 j 轴翻转.
        let affine = Affine::from_spacing([-1.0, -1.0, 1.0], [9.0, 11.0, 0.0]);
        let image = NiftiImage::from_array(phantom().into_dyn(), affine).unwrap();

        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        let ras = seg.segment(image.clone()).unwrap();
        assert_eq!(ras.labels().orientation(), Orientation::RAS);
        let flipped: Vec<_> = cube_positions()
            .into_iter()
            .map(|(i, j, k)| (9 - i, 11 - j, k))
            .sorted()
            .collect();
        assert_eq!(ras.labels().positions_of(label::LESION), flipped);

        let config = small_config().with_invert_orientation(true);
        let seg = LesionSegmentor::new(threshold as ModelFn, config).unwrap();
        let back = seg.segment(image).unwrap();
        assert_eq!(back.labels().orientation().to_string(), "LPS");
        assert!(back.affine().close_to(&affine));
        assert_eq!(back.labels().positions_of(label::LESION), cube_positions());
    }

    #[test]
    fn test_largest_component_option() {
        let mut data = phantom();
        data[(0, 0, 0)] = 200.0;
        let image = NiftiImage::from_array(data.into_dyn(), Affine::identity()).unwrap();

        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        assert_eq!(seg.segment(image.clone()).unwrap().lesion_voxels(), 65);

        let config = small_config().with_largest_component(true, Connectivity::Full);
        let seg = LesionSegmentor::new(threshold as ModelFn, config).unwrap();
        assert_eq!(seg.segment(image).unwrap().lesion_voxels(), 64);
    }

    #[test]
    fn test_file_round_trip() {
        init_log();
        let input = temp_path("flair.nii.gz");
        let output = temp_path("mask.nii.gz");
        let affine = Affine::from_spacing([1.0, 1.0, 1.0], [-5.0, 3.0, 7.0]);
        let raw = phantom().mapv(|v| v as u8);
        let reference = NiftiImage::from_array(phantom().into_dyn(), affine).unwrap();
        save_label(&input, raw.view(), &affine, reference.header()).unwrap();

        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        let ans = seg.segment_to_file(&input, &output).unwrap();
        let written = NiftiImage::load(&output).unwrap();
        assert_eq!(written.shape(), [10, 12, 8]);
        assert!(written.affine().close_to(&affine));
        let lesion = written.data().iter().filter(|v| **v == label::LESION as f32).count();
        assert_eq!(lesion, ans.lesion_voxels());
        assert_eq!(lesion, 64);

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&output).unwrap();
    }

    #[test]
    fn test_failures_leave_no_output() {
        let output = temp_path("never.nii.gz");
        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        let e = seg
            .segment_to_file(temp_path("missing.nii.gz"), &output)
            .unwrap_err();
        assert!(matches!(e, SegError::InputNotFound { .. }));
        assert!(!output.exists());

        let input = temp_path("failing-input.nii.gz");
        let raw = phantom().mapv(|v| v as u8);
        let reference = NiftiImage::from_array(phantom().into_dyn(), Affine::identity()).unwrap();
        save_label(&input, raw.view(), &Affine::identity(), reference.header()).unwrap();
        let failing = |_: ArrayView5<'_, f32>| -> Result<Array5<f32>, ModelError> { Err("device lost".into()) };
        let seg = LesionSegmentor::new(failing, small_config()).unwrap();
        let e = seg.segment_to_file(&input, &output).unwrap_err();
        assert!(matches!(e, SegError::InferenceFailure { batch: 0, .. }));
        assert!(e.to_string().contains("device lost"));
        assert!(!output.exists());
        std::fs::remove_file(&input).unwrap();
    }

    struct ThresholdLoader;

    impl ModelLoader for ThresholdLoader {
        type Model = ModelFn;

        fn load(&self, _: &std::path::Path) -> Result<ModelFn, ModelError> {
            Ok(threshold as ModelFn)
        }
    }

    #[test]
    fn test_from_store() {
        let dir = temp_path("store");
        std::fs::create_dir_all(&dir).unwrap();
        let store = WeightStore::new(&dir);

        assert!(matches!(
            LesionSegmentor::from_store(&store, &ThresholdLoader, small_config()),
            Err(SegError::ModelLoadFailure { .. })
        ));

        let degenerate = crate::config::IntensityRange {
            a_max: 0.0,
            ..Default::default()
        };
        std::fs::write(store.weights_path(), b"weights").unwrap();
        let config = small_config().with_intensity(degenerate);
        assert!(matches!(
            LesionSegmentor::from_store(&store, &ThresholdLoader, config),
            Err(SegError::InvalidConfig(_))
        ));

        let seg = LesionSegmentor::from_store(&store, &ThresholdLoader, small_config()).unwrap();
        let image = NiftiImage::from_array(phantom().into_dyn(), Affine::identity()).unwrap();
        assert_eq!(seg.segment(image).unwrap().lesion_voxels(), 64);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_invalid_config_and_cancel() {
        let bad = small_config().with_overlap(1.5);
        assert!(matches!(
            LesionSegmentor::new(threshold as ModelFn, bad),
            Err(SegError::InvalidConfig(_))
        ));

        let seg = LesionSegmentor::new(threshold as ModelFn, small_config()).unwrap();
        let image = NiftiImage::from_array(phantom().into_dyn(), Affine::identity()).unwrap();
        let cancel = AtomicBool::new(false);
        cancel.store(true, Ordering::Relaxed);
        let e = seg.segment_with_cancel(image, &cancel).unwrap_err();
        assert!(matches!(e, SegError::Cancelled { completed: 0, .. }));
    }
}
