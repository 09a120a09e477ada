use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;

/// Supplies the project context substituted into the system prompt.
///
/// Called once per backend request, so implementations should return the
/// current state rather than a snapshot taken at construction.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn context(&self) -> String;
}

/// A fixed piece of context text.
#[derive(Debug, Clone, Default)]
pub struct StaticContext(pub String);

#[async_trait]
impl ContextSource for StaticContext {
    async fn context(&self) -> String {
        self.0.clone()
    }
}

/// The contents of a list of files, re-read on every call.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    files: Vec<PathBuf>,
}

impl FileContext {
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

#[async_trait]
impl ContextSource for FileContext {
    async fn context(&self) -> String {
        let mut context = String::new();
        for file in &self.files {
            context.push_str(&format!("File: {}\n", file.display()));
            match fs::read_to_string(file).await {
                Ok(content) => context.push_str(&content),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "context file unreadable");
                    context.push_str("File content not available");
                }
            }
            context.push_str("\n\n");
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_context_renders_each_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rs");
        std::fs::write(&a, "fn a() {}").unwrap();
        let missing = dir.path().join("missing.rs");

        let context = FileContext::new([a.clone(), missing.clone()]).context().await;

        assert_eq!(
            context,
            format!(
                "File: {}\nfn a() {{}}\n\nFile: {}\nFile content not available\n\n",
                a.display(),
                missing.display()
            )
        );
    }

    #[tokio::test]
    async fn test_file_context_sees_later_edits() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "one").unwrap();
        let source = FileContext::new([&a]);
        assert!(source.context().await.contains("one"));

        std::fs::write(&a, "two").unwrap();
        assert!(source.context().await.contains("two"));
    }

    #[test]
    fn test_static_context() {
        assert_eq!(
            tokio_test::block_on(StaticContext("hello".into()).context()),
            "hello"
        );
        assert_eq!(tokio_test::block_on(StaticContext::default().context()), "");
    }
}
