use std::collections::HashMap;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tasks draining a child's stdout and stderr so it never blocks on a full pipe.
#[derive(Debug)]
pub struct OutputReaders {
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

impl OutputReaders {
    /// Take the child's piped output handles and start reading them.
    pub fn spawn(child: &mut Child) -> Self {
        Self {
            stdout: read_pipe(child.stdout.take()),
            stderr: read_pipe(child.stderr.take()),
        }
    }

    /// Wait for both pipes to close and return (stdout, stderr).
    pub async fn collect(self) -> (String, String) {
        let stdout = self.stdout.await.unwrap_or_default();
        let stderr = self.stderr.await.unwrap_or_default();
        (stdout, stderr)
    }

    fn abort(&self) {
        self.stdout.abort();
        self.stderr.abort();
    }
}

fn read_pipe<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[derive(Debug)]
struct Tracked {
    child: Child,
    output: Option<OutputReaders>,
}

impl Tracked {
    fn stop_readers(&self) {
        if let Some(output) = &self.output {
            output.abort();
        }
    }
}

/// Long-running child processes started by tools, keyed by a generated id.
///
/// Anything still tracked when the store is dropped gets killed.
#[derive(Debug, Default)]
pub struct ProcessStore {
    children: Mutex<HashMap<String, Tracked>>,
}

impl ProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a running child and return the id handed to the model.
    pub fn store(&self, child: Child) -> String {
        self.insert(Tracked {
            child,
            output: None,
        })
    }

    /// Track a running child together with the tasks draining its output.
    pub fn store_with_output(&self, child: Child, output: OutputReaders) -> String {
        self.insert(Tracked {
            child,
            output: Some(output),
        })
    }

    fn insert(&self, tracked: Tracked) -> String {
        let id = Uuid::new_v4().to_string();
        debug!(process_id = %id, pid = ?tracked.child.id(), "tracking background process");
        self.lock().insert(id.clone(), tracked);
        id
    }

    /// Stop tracking a process without killing it.
    pub fn remove(&self, id: &str) -> Option<Child> {
        self.lock().remove(id).map(|tracked| {
            tracked.stop_readers();
            tracked.child
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill and forget a process. Returns false if the id is unknown.
    pub async fn kill(&self, id: &str) -> std::io::Result<bool> {
        let Some(mut child) = self.remove(id) else {
            return Ok(false);
        };
        child.kill().await?;
        Ok(true)
    }

    /// Kill all stored processes
    pub fn kill_all(&self) {
        for (id, mut tracked) in self.lock().drain() {
            tracked.stop_readers();
            if let Err(e) = tracked.child.start_kill() {
                warn!(process_id = %id, error = %e, "failed to kill background process");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tracked>> {
        // A poisoned map is still a valid map.
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ProcessStore {
    fn drop(&mut self) {
        self.kill_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_store_and_kill() {
        let store = ProcessStore::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();

        let id = store.store(child);
        assert!(store.contains(&id));

        assert!(store.kill(&id).await.unwrap());
        assert!(store.is_empty());
        assert!(!store.kill(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_output_readers_drain_large_output() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("head -c 200000 /dev/zero | tr '\\0' x; echo done >&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let output = OutputReaders::spawn(&mut child);

        let status = child.wait().await.unwrap();
        let (stdout, stderr) = output.collect().await;
        assert!(status.success());
        assert_eq!(stdout.len(), 200_000);
        assert_eq!(stderr, "done\n");
    }
}
