//! 融合方式与批大小的消融实验.
//!
//! 在合成体模上, 用窗口边缘退化的模型对比高斯融合与均匀融合的误检数量,
//! 并验证不同批大小得到完全相同的分割结果.

mod model;
mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let result = runner::run();
    result.analyze().unwrap();
}
