//! GenerationService port - 生成ステップの抽象化
//!
//! 自然言語からコードを作る部分そのものはコアの外にあります。
//! コアは `CapabilityResult` の契約だけを見ます。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::context::{CapabilityContext, CapabilityResult};
use crate::workspace::SandboxedWorkspace;

/// Starting point of the primary generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Build on top of a seeded template.
    Template,
    /// Start from an empty workspace.
    Scratch,
}

/// Which kind of work the service is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Planning,
    Generation { mode: GenerationMode },
    Validation,
    Refinement { iteration: u32 },
}

/// One call into the generation service.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub kind: StepKind,
    pub context: &'a CapabilityContext,
    pub workspace: &'a SandboxedWorkspace,
    /// Cap on tool calls for this step, if any.
    pub tool_call_budget: Option<u32>,
}

/// GenerationService は 1 ステップ分の生成を行う
///
/// 失敗は `CapabilityResult::failure` で返します（`Err` は使わない）。
/// ファイルの書き込みは必ず `request.workspace` 経由で行います。
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn run(&self, request: StepRequest<'_>) -> CapabilityResult;
}
