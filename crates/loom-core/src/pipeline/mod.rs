//! Pipeline - 生成ステップの順序付き実行
//!
//! - [`Capability`]: 1 ステップの契約（skip 判定・前提チェック・実行）
//! - [`CapabilityPipeline`]: ステージ単位で順に実行し、結果をコンテキストへ畳み込む
//! - [`PipelineBuilder`]: セッション設定から決定的にステップ列を作る

pub mod builder;
pub mod capability;
pub mod steps;

pub use builder::{BuildError, PipelineBuilder, MAX_REFINEMENT_ITERATIONS};
pub use capability::{Capability, CapabilityPipeline, Stage, StageReport};
pub use steps::{
    CodeGenerationStep, PlanningStep, RefinementStep, TemplateSeedingStep, ValidationStep,
};
