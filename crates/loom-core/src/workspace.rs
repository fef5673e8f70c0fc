//! SandboxedWorkspace - セッション単位のファイル境界
//!
//! すべてのファイル操作は `resolve` ひとつを通ります。ここで
//! 相対パスの検証とベースディレクトリ外への脱出チェックを行うので、
//! 呼び出し側ごとにチェックを書く必要はありません。
//!
//! 書き込みはワークスペースと永続化シンクの両方に成功したときだけ成功です。
//! シンクが失敗したらローカルの変更を巻き戻します。

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;

use crate::config::WorkspaceConfig;
use crate::domain::errors::WorkspaceError;
use crate::domain::events::SessionEvent;
use crate::domain::ids::SessionId;
use crate::ports::PersistenceSink;

static DRIVE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:").expect("static regex"));

static TEMPLATE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("static regex"));

/// Whitelisted template trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateCatalog {
    pub dir: PathBuf,
    pub allowed: Vec<String>,
}

impl TemplateCatalog {
    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self {
            dir: config.templates_dir.clone(),
            allowed: config.allowed_templates.clone(),
        }
    }

    /// Name syntax and allow-list. Touches no filesystem.
    fn check(&self, name: &str) -> Result<(), WorkspaceError> {
        if !TEMPLATE_NAME.is_match(name) || !self.allowed.iter().any(|a| a == name) {
            return Err(WorkspaceError::TemplateNotAllowed(name.to_string()));
        }
        Ok(())
    }
}

pub struct SandboxedWorkspace {
    session_id: SessionId,
    root: PathBuf,
    templates: TemplateCatalog,
    persistence: Arc<dyn PersistenceSink>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl std::fmt::Debug for SandboxedWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedWorkspace")
            .field("session_id", &self.session_id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl SandboxedWorkspace {
    /// Create (or reopen) `<base_dir>/<session_id>`.
    pub async fn open(
        config: &WorkspaceConfig,
        session_id: SessionId,
        persistence: Arc<dyn PersistenceSink>,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Result<Self, WorkspaceError> {
        let base = &config.base_dir;
        tokio::fs::create_dir_all(base)
            .await
            .map_err(|e| WorkspaceError::io(base, e))?;
        let base = tokio::fs::canonicalize(base)
            .await
            .map_err(|e| WorkspaceError::io(base, e))?;

        let root = base.join(session_id.to_string());
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| WorkspaceError::io(&root, e))?;

        Ok(Self {
            session_id,
            root,
            templates: TemplateCatalog::from_config(config),
            persistence,
            events,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a workspace-relative path to an absolute path inside the root.
    ///
    /// Lexical checks only. [`resolve`](Self::resolve) also follows symlinks.
    pub fn resolve_lexical(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let reject = |reason: &'static str| WorkspaceError::PathRejected {
            path: relative.to_string(),
            reason,
        };

        if relative.trim().is_empty() {
            return Err(reject("empty path"));
        }
        if relative.contains('\0') {
            return Err(reject("NUL byte"));
        }
        if relative.contains('\\') {
            return Err(reject("backslash"));
        }
        if relative.contains("..") {
            return Err(reject("traversal sequence"));
        }
        if relative.starts_with('/') {
            return Err(reject("absolute path"));
        }
        if DRIVE_PREFIX.is_match(relative) {
            return Err(reject("drive letter"));
        }

        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(reject("non-relative component")),
            }
        }
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(WorkspaceError::Escapes(resolved));
        }
        Ok(resolved)
    }

    /// Like [`resolve_lexical`](Self::resolve_lexical), then rejects paths whose
    /// nearest existing ancestor is a symlink pointing outside the root.
    pub async fn resolve(&self, relative: &str) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.resolve_lexical(relative)?;

        let mut existing = resolved.as_path();
        loop {
            let found = tokio::fs::try_exists(existing)
                .await
                .map_err(|e| WorkspaceError::io(existing, e))?;
            if found {
                break;
            }
            match existing.parent() {
                Some(parent) if parent.starts_with(&self.root) => existing = parent,
                _ => return Ok(resolved),
            }
        }
        let canonical = tokio::fs::canonicalize(existing)
            .await
            .map_err(|e| WorkspaceError::io(existing, e))?;
        if !canonical.starts_with(&self.root) {
            return Err(WorkspaceError::Escapes(canonical));
        }
        Ok(resolved)
    }

    fn relative_display(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Write `content` to the workspace and to the persistence sink.
    ///
    /// If the sink rejects the file the local write is rolled back and the
    /// call fails.
    pub async fn write_file(&self, relative: &str, content: &[u8]) -> Result<(), WorkspaceError> {
        let path = self.resolve(relative).await?;
        let shown = self.relative_display(&path);

        let previous = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(WorkspaceError::io(&path, e)),
        };

        atomic_write(path.clone(), content.to_vec()).await?;

        if let Err(e) = self
            .persistence
            .save_file(self.session_id, &shown, content)
            .await
        {
            tracing::warn!(session_id = %self.session_id, path = %shown, error = %e, "file persistence failed, rolling back");
            let rollback = match previous {
                Some(bytes) => atomic_write(path.clone(), bytes).await,
                None => tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| WorkspaceError::io(&path, e)),
            };
            if let Err(rollback_err) = rollback {
                tracing::error!(path = %shown, error = %rollback_err, "rollback failed");
            }
            return Err(WorkspaceError::Persistence(e));
        }

        tracing::debug!(session_id = %self.session_id, path = %shown, bytes = content.len(), "file written");
        if let Some(events) = &self.events {
            let event = SessionEvent::FileUpdated {
                session_id: self.session_id,
                path: shown,
            };
            if events.send(event).is_err() {
                tracing::trace!(session_id = %self.session_id, "event channel closed");
            }
        }
        Ok(())
    }

    pub async fn read_file(&self, relative: &str) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.resolve(relative).await?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => WorkspaceError::NotFound(relative.to_string()),
            _ => WorkspaceError::io(&path, e),
        })
    }

    pub async fn read_to_string(&self, relative: &str) -> Result<String, WorkspaceError> {
        let bytes = self.read_file(relative).await?;
        String::from_utf8(bytes).map_err(|e| {
            WorkspaceError::io(
                self.root.join(relative),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    pub async fn exists(&self, relative: &str) -> Result<bool, WorkspaceError> {
        let path = self.resolve(relative).await?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| WorkspaceError::io(&path, e))
    }

    /// Every regular file under the root, as sorted `/`-separated relative paths.
    /// Symbolic links are not followed.
    pub async fn list_files(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut files = Vec::new();
        for path in walk_files(&self.root).await? {
            files.push(self.relative_display(&path));
        }
        files.sort();
        Ok(files)
    }

    /// Copy a whitelisted template tree into the workspace. Returns the file count.
    pub async fn seed_template(&self, name: &str) -> Result<usize, WorkspaceError> {
        self.templates.check(name)?;

        let source = self.templates.dir.join(name);
        match tokio::fs::symlink_metadata(&source).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(WorkspaceError::TemplateNotFound(name.to_string())),
        }

        let mut copied = 0;
        for file in walk_files(&source).await? {
            let Ok(relative) = file.strip_prefix(&source) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let content = tokio::fs::read(&file)
                .await
                .map_err(|e| WorkspaceError::io(&file, e))?;
            self.write_file(&relative, &content).await?;
            copied += 1;
        }

        tracing::info!(session_id = %self.session_id, template = name, files = copied, "template seeded");
        Ok(copied)
    }
}

/// Temp file in the target directory, then rename over the target.
async fn atomic_write(path: PathBuf, content: Vec<u8>) -> Result<(), WorkspaceError> {
    let Some(parent) = path.parent().map(Path::to_path_buf) else {
        return Err(WorkspaceError::Escapes(path));
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| WorkspaceError::io(&parent, e))?;

    tokio::task::spawn_blocking(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| WorkspaceError::io(&parent, e))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| WorkspaceError::io(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| WorkspaceError::io(&path, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| WorkspaceError::io("<blocking task>", std::io::Error::other(e)))?
}

/// Regular files below `root`, skipping symbolic links.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| WorkspaceError::io(entry.path(), e))?;
            if file_type.is_symlink() {
                tracing::debug!(path = %entry.path().display(), "skipping symlink");
            } else if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryPersistence;
    use crate::ports::TimelineEntry;
    use proptest::prelude::*;
    use rstest::rstest;
    use ulid::Ulid;

    struct Fixture {
        _base: tempfile::TempDir,
        templates: tempfile::TempDir,
        persistence: Arc<InMemoryPersistence>,
        workspace: SandboxedWorkspace,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    async fn fixture() -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        let persistence = Arc::new(InMemoryPersistence::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let config = WorkspaceConfig {
            base_dir: base.path().to_path_buf(),
            templates_dir: templates.path().to_path_buf(),
            allowed_templates: vec!["vite-react".to_string()],
        };
        let workspace = SandboxedWorkspace::open(
            &config,
            SessionId::from_ulid(Ulid::new()),
            persistence.clone(),
            Some(tx),
        )
        .await
        .unwrap();
        Fixture {
            _base: base,
            templates,
            persistence,
            workspace,
            events: rx,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let mut f = fixture().await;
        let content = b"export const x = 1;\n\x00\xff";

        f.workspace.write_file("src/lib/x.ts", content).await.unwrap();

        assert_eq!(f.workspace.read_file("src/lib/x.ts").await.unwrap(), content);
        assert!(f.workspace.exists("./src/lib/x.ts").await.unwrap());
        assert_eq!(f.workspace.list_files().await.unwrap(), vec!["src/lib/x.ts"]);
        assert!(matches!(
            f.events.try_recv(),
            Ok(SessionEvent::FileUpdated { path, .. }) if path == "src/lib/x.ts"
        ));

        let timeline = f
            .persistence
            .get_timeline_items(f.workspace.session_id())
            .await
            .unwrap();
        assert!(timeline.iter().any(|item| matches!(
            &item.entry,
            TimelineEntry::FileSaved { path, .. } if path == "src/lib/x.ts"
        )));
    }

    #[tokio::test]
    async fn write_succeeds_after_event_receiver_is_gone() {
        let Fixture {
            _base,
            persistence,
            workspace,
            events,
            ..
        } = fixture().await;
        drop(events);

        workspace.write_file("src/App.tsx", b"x").await.unwrap();

        assert!(persistence.file(workspace.session_id(), "src/App.tsx").is_some());
    }

    #[tokio::test]
    async fn resolve_lexical_does_not_touch_the_filesystem() {
        let f = fixture().await;
        let resolved = f.workspace.resolve_lexical("not/yet/created.ts").unwrap();
        assert_eq!(resolved, f.workspace.root().join("not/yet/created.ts"));
        assert_eq!(f.workspace.resolve("not/yet/created.ts").await.unwrap(), resolved);
    }

    #[rstest]
    #[case::parent("../etc/passwd")]
    #[case::nested_parent("src/../../secret")]
    #[case::absolute("/etc/passwd")]
    #[case::drive("C:/Windows/system32")]
    #[case::drive_backslash("C:\\Windows")]
    #[case::backslash("src\\main.ts")]
    #[case::empty("")]
    #[case::nul("a\0b")]
    #[tokio::test]
    async fn rejects_unsafe_paths(#[case] path: &str) {
        let f = fixture().await;
        assert!(f.workspace.write_file(path, b"x").await.is_err());
        assert!(f.workspace.resolve(path).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let f = fixture().await;
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), f.workspace.root().join("link")).unwrap();

        let err = f.workspace.write_file("link/evil.txt", b"x").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Escapes(_)));
        assert!(!outside.path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn sink_failure_rolls_back_new_file() {
        let f = fixture().await;
        f.persistence.fail_file_saves(true);

        let err = f.workspace.write_file("a.txt", b"new").await.unwrap_err();

        assert!(matches!(err, WorkspaceError::Persistence(_)));
        assert!(!f.workspace.exists("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn sink_failure_restores_previous_content() {
        let f = fixture().await;
        f.workspace.write_file("a.txt", b"old").await.unwrap();
        f.persistence.fail_file_saves(true);

        assert!(f.workspace.write_file("a.txt", b"new").await.is_err());
        assert_eq!(f.workspace.read_file("a.txt").await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn seeds_whitelisted_template() {
        let f = fixture().await;
        let tpl = f.templates.path().join("vite-react");
        std::fs::create_dir_all(tpl.join("src")).unwrap();
        std::fs::write(tpl.join("package.json"), "{}").unwrap();
        std::fs::write(tpl.join("src/main.tsx"), "render()").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/passwd", tpl.join("passwd")).unwrap();

        let copied = f.workspace.seed_template("vite-react").await.unwrap();

        assert_eq!(copied, 2);
        assert_eq!(
            f.workspace.list_files().await.unwrap(),
            vec!["package.json", "src/main.tsx"]
        );
    }

    #[rstest]
    #[case::traversal("../vite-react")]
    #[case::not_listed("nextjs")]
    #[case::uppercase("Vite-React")]
    #[tokio::test]
    async fn rejects_unlisted_templates(#[case] name: &str) {
        let f = fixture().await;
        assert!(matches!(
            f.workspace.seed_template(name).await,
            Err(WorkspaceError::TemplateNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn missing_template_dir_is_reported() {
        let f = fixture().await;
        assert!(matches!(
            f.workspace.seed_template("vite-react").await,
            Err(WorkspaceError::TemplateNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn any_path_with_dotdot_is_rejected(prefix in "[a-z/]{0,8}", suffix in "[a-z/]{0,8}") {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let f = rt.block_on(fixture());
            let path = format!("{prefix}..{suffix}");
            prop_assert!(f.workspace.resolve_lexical(&path).is_err());
        }

        #[test]
        fn drive_and_absolute_forms_are_rejected(letter in "[A-Za-z]", rest in "[a-z/]{0,8}") {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let f = rt.block_on(fixture());
            let drive = format!("{letter}:{rest}");
            let absolute = format!("/{rest}");
            let backslashed = format!("{rest}\\x");
            prop_assert!(f.workspace.resolve_lexical(&drive).is_err());
            prop_assert!(f.workspace.resolve_lexical(&absolute).is_err());
            prop_assert!(f.workspace.resolve_lexical(&backslashed).is_err());
        }

        #[test]
        fn resolved_paths_stay_under_root(segments in prop::collection::vec("[a-zA-Z0-9_.-]{1,8}", 1..5)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let f = rt.block_on(fixture());
            let path = segments.join("/");
            if let Ok(resolved) = rt.block_on(f.workspace.resolve(&path)) {
                prop_assert!(resolved.starts_with(f.workspace.root()));
            }
        }
    }
}
