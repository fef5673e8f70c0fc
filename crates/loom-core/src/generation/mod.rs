//! Generation - 生成ライフサイクル
//!
//! 純粋な状態遷移（[`machine`]）と、それを駆動してパイプラインを実行する
//! ランナー（[`runner`]）に分かれています。

pub mod machine;
pub mod runner;

pub use machine::{GenerationEvent, GenerationState, transition};
pub use runner::{GenerationRunner, RunnerDeps};
