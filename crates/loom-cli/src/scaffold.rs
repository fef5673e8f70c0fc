//! Scaffold - 決定的なオフライン生成サービス
//!
//! モデルを呼ばずに、プロンプトを埋め込んだ最小の Vite + React
//! プロジェクトを書き出します。エンジン全体の配線確認用です。

use async_trait::async_trait;
use loom_core::domain::{
    ArchitecturePlan, CapabilityResult, ContextUpdates, TokenUsage, ValidationOutcome,
};
use loom_core::ports::{GenerationService, StepKind, StepRequest};
use loom_core::workspace::SandboxedWorkspace;

const FILES: [&str; 4] = ["package.json", "index.html", "src/main.tsx", "src/App.tsx"];

pub struct ScaffoldGenerator;

#[async_trait]
impl GenerationService for ScaffoldGenerator {
    async fn run(&self, request: StepRequest<'_>) -> CapabilityResult {
        let prompt = request.context.prompt.as_str();
        let usage = TokenUsage::new(estimate_tokens(prompt), 0);

        match request.kind {
            StepKind::Planning => {
                let plan = ArchitecturePlan {
                    summary: format!("single-page app: {}", first_line(prompt)),
                    files: FILES.iter().map(|f| f.to_string()).collect(),
                };
                CapabilityResult::success()
                    .with_usage(usage, 0.0, 0)
                    .with_updates(ContextUpdates {
                        plan: Some(plan),
                        ..ContextUpdates::default()
                    })
            }
            StepKind::Generation { .. } => match write_project(request.workspace, prompt).await {
                Ok(written) => CapabilityResult::success().with_usage(
                    TokenUsage::new(usage.input, written / 4),
                    0.0,
                    FILES.len() as u32,
                ),
                Err(e) => CapabilityResult::failure(e),
            },
            StepKind::Validation | StepKind::Refinement { .. } => {
                let outcome = check_project(request.workspace).await;
                CapabilityResult::success().with_updates(ContextUpdates {
                    validation: Some(outcome),
                    ..ContextUpdates::default()
                })
            }
        }
    }
}

async fn write_project(workspace: &SandboxedWorkspace, prompt: &str) -> Result<u64, String> {
    let title = html_escape(first_line(prompt));
    let files = [
        ("package.json", PACKAGE_JSON.to_string()),
        ("index.html", INDEX_HTML.replace("{title}", &title)),
        ("src/main.tsx", MAIN_TSX.to_string()),
        ("src/App.tsx", APP_TSX.replace("{title}", &title)),
    ];

    let mut written = 0u64;
    for (path, content) in files {
        workspace
            .write_file(path, content.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        written += content.len() as u64;
    }
    Ok(written)
}

async fn check_project(workspace: &SandboxedWorkspace) -> ValidationOutcome {
    let mut missing = Vec::new();
    for path in FILES {
        if !workspace.exists(path).await.unwrap_or(false) {
            missing.push(format!("missing {path}"));
        }
    }
    if missing.is_empty() {
        ValidationOutcome::passed()
    } else {
        ValidationOutcome::failed(missing)
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn first_line(prompt: &str) -> &str {
    prompt.lines().next().unwrap_or_default().trim()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('{', "&#123;")
        .replace('}', "&#125;")
}

const PACKAGE_JSON: &str = r#"{
  "name": "loom-preview",
  "private": true,
  "type": "module",
  "scripts": { "dev": "vite", "build": "vite build" },
  "dependencies": { "react": "^18.3.1", "react-dom": "^18.3.1" },
  "devDependencies": { "@vitejs/plugin-react": "^4.3.1", "vite": "^5.4.0" }
}
"#;

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>{title}</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#;

const MAIN_TSX: &str = r#"import React from "react";
import { createRoot } from "react-dom/client";
import App from "./App";

createRoot(document.getElementById("root")!).render(<App />);
"#;

const APP_TSX: &str = r#"export default function App() {
  return <main><h1>{title}</h1></main>;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_and_jsx_braces() {
        assert_eq!(html_escape("<b>{x}</b>"), "&lt;b&gt;&#123;x&#125;&lt;/b&gt;");
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn first_line_trims() {
        assert_eq!(first_line("  a todo app \nwith tags"), "a todo app");
    }
}
