//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Shape3d};

pub use crate::data::{
    Affine, AxisCode, Field, GeometryTracker, LabelVolume, NiftiImage, Orientation, SpatialAttr,
    SpatialMeta, Volume,
};

pub use crate::config::{BlendMode, Connectivity, IntensityRange, SegConfig};
pub use crate::consts::label::{BACKGROUND, LESION};

pub use crate::inference::{
    ModelError, ModelLoader, SegmentationModel, SlidingWindowInferer, WeightStore,
};
pub use crate::post_proc::PostProcessor;
pub use crate::transforms::Preprocessor;

pub use crate::{LesionSegmentor, SegError, SegResult, Segmentation, Stage};
