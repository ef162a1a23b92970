//! Destinations for received chunk sessions.
//!
//! A sink is only visible to consumers after `finalize`. `discard` must leave
//! nothing behind that a consumer could mistake for a complete resource.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use stratus_protocol::{ServiceTemplate, TransferHeader};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[async_trait]
pub trait ResourceSink: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Make the written content visible. Consumes the sink.
    async fn finalize(self: Box<Self>) -> io::Result<()>;

    /// Drop the written content. Consumes the sink.
    async fn discard(self: Box<Self>);
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, transfer: &TransferHeader) -> io::Result<Box<dyn ResourceSink>>;
}

#[async_trait]
impl SinkFactory for Arc<dyn SinkFactory> {
    async fn open(&self, transfer: &TransferHeader) -> io::Result<Box<dyn ResourceSink>> {
        self.as_ref().open(transfer).await
    }
}

// ============================================================================
// File sink
// ============================================================================

/// File name of an installed template payload inside its directory.
pub const TEMPLATE_FILE_NAME: &str = "template.bin";

/// Directory below the root holding partial sessions.
const PARTIAL_DIR: &str = ".partial";

/// Installs templates at `<root>/<storage>/<prefix>/<name>/template.bin`.
///
/// Bytes go to `<root>/.partial/<id>` first and are renamed into place on
/// finalize, so a reader never sees a half-written template.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    root: PathBuf,
}

impl FileSinkFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a template is installed into.
    pub fn template_dir(&self, template: &ServiceTemplate) -> io::Result<PathBuf> {
        let mut dir = self.root.clone();
        for part in [&template.storage, &template.prefix, &template.name] {
            validate_component(part)?;
            dir.push(part);
        }
        Ok(dir)
    }
}

/// Reject path components that would escape the storage root.
fn validate_component(part: &str) -> io::Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid template path component: {part:?}"),
        )),
    }
}

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn open(&self, transfer: &TransferHeader) -> io::Result<Box<dyn ResourceSink>> {
        let dest_dir = self.template_dir(&transfer.template)?;
        let partial_dir = self.root.join(PARTIAL_DIR);
        tokio::fs::create_dir_all(&partial_dir).await?;

        let partial = partial_dir.join(Uuid::new_v4().to_string());
        let file = tokio::fs::File::create(&partial).await?;

        Ok(Box::new(FileSink {
            file,
            partial,
            dest_dir,
            pre_clear: transfer.pre_clear,
        }))
    }
}

struct FileSink {
    file: tokio::fs::File,
    partial: PathBuf,
    dest_dir: PathBuf,
    pre_clear: bool,
}

#[async_trait]
impl ResourceSink for FileSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    async fn finalize(self: Box<Self>) -> io::Result<()> {
        let FileSink {
            mut file,
            partial,
            dest_dir,
            pre_clear,
        } = *self;

        let installed = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            if pre_clear && tokio::fs::try_exists(&dest_dir).await? {
                tokio::fs::remove_dir_all(&dest_dir).await?;
            }
            tokio::fs::create_dir_all(&dest_dir).await?;
            tokio::fs::rename(&partial, dest_dir.join(TEMPLATE_FILE_NAME)).await
        }
        .await;

        if installed.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        installed
    }

    async fn discard(self: Box<Self>) {
        let FileSink { file, partial, .. } = *self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            tracing::warn!(path = %partial.display(), "transfer: failed to remove partial file: {e}");
        }
    }
}

// ============================================================================
// Memory sink
// ============================================================================

/// Keeps installed templates in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    installed: Arc<Mutex<HashMap<ServiceTemplate, Bytes>>>,
    discarded: Arc<AtomicUsize>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed content of a template, if a session for it completed.
    pub fn get(&self, template: &ServiceTemplate) -> Option<Bytes> {
        self.installed
            .lock()
            .ok()
            .and_then(|map| map.get(template).cloned())
    }

    /// Number of installed templates.
    pub fn len(&self) -> usize {
        self.installed.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sessions that were discarded instead of installed.
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn open(&self, transfer: &TransferHeader) -> io::Result<Box<dyn ResourceSink>> {
        Ok(Box::new(MemorySink {
            template: transfer.template.clone(),
            buf: Vec::new(),
            store: self.clone(),
        }))
    }
}

struct MemorySink {
    template: ServiceTemplate,
    buf: Vec<u8>,
    store: MemorySinkFactory,
}

#[async_trait]
impl ResourceSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> io::Result<()> {
        let MemorySink {
            template,
            buf,
            store,
        } = *self;
        let mut map = store
            .installed
            .lock()
            .map_err(|_| io::Error::other("memory sink store poisoned"))?;
        map.insert(template, Bytes::from(buf));
        Ok(())
    }

    async fn discard(self: Box<Self>) {
        self.store.discarded.fetch_add(1, Ordering::Relaxed);
    }
}
