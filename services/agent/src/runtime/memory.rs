//! In-memory runtime for development and testing.
//!
//! Everything a real runtime would keep on disk or in the kernel lives in a
//! mutex-guarded map here: images, content blobs, container records,
//! snapshot layers (as path -> bytes maps) and tasks. Filesystem diffs are
//! real gzip-compressed tar layers with `.wh.` whiteout entries, so
//! checkpoint/restore exercises the same layer round trip a real snapshotter
//! would.
//!
//! A [`MemoryRegistry`] stands in for a remote registry and can be shared
//! between several runtimes to simulate two nodes pushing and pulling
//! through the same registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use berth_checkpoint_format::{
    digest_of, CheckpointIndex, Descriptor, ImageManifest, GC_REF_CONTENT_PREFIX,
    MEDIA_TYPE_CHECKPOINT_CONFIG, MEDIA_TYPE_CHECKPOINT_CRIU, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_GZIP,
};
use bytes::Bytes;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::watch;
use tracing::debug;

use super::{
    registry_host, ContainerRecord, CreateTaskOptions, ExitStatus, Image, RegistryOptions,
    Runtime, RuntimeError, RuntimeResult, Signal, SnapshotInfo, TaskMetrics, TaskStatus,
};

const WHITEOUT_PREFIX: &str = ".wh.";

/// Baseline resident memory reported for every live task.
const BASE_MEMORY_USAGE: u64 = 64 * 1024 * 1024;

/// Page cache reported for every live task.
const BASE_MEMORY_CACHE: u64 = 16 * 1024 * 1024;

const DEFAULT_PIDS_LIMIT: u64 = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    tags: HashMap<String, Descriptor>,
    blobs: HashMap<String, Bytes>,
}

/// A registry shared between in-memory runtimes.
pub struct MemoryRegistry {
    inner: Mutex<RegistryInner>,
    /// Hosts that only speak plain HTTP.
    plain_http_hosts: Mutex<HashSet<String>>,
    available: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            plain_http_hosts: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
        })
    }

    /// Make `host` answer over plain HTTP only. HTTPS clients are refused.
    pub fn serve_plain_http(&self, host: &str) {
        lock(&self.plain_http_hosts).insert(host.to_string());
    }

    /// Simulate the registry going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Publish a single-layer image built from `files`.
    pub fn publish_image(&self, reference: &str, files: &[(&str, &[u8])]) -> RuntimeResult<Descriptor> {
        let upper: BTreeMap<String, Option<Vec<u8>>> = files
            .iter()
            .map(|(path, data)| (normalize_path(path), Some(data.to_vec())))
            .collect();
        let layer = build_layer(&upper)?;
        let layer_desc = Descriptor::for_bytes(MEDIA_TYPE_LAYER_GZIP, &layer);

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": [layer_desc.digest] },
        }))
        .map_err(|e| RuntimeError::Other(e.to_string()))?;
        let config_desc = Descriptor::for_bytes(MEDIA_TYPE_IMAGE_CONFIG, &config);

        let manifest = ImageManifest::new(config_desc, vec![layer_desc]).to_vec()?;
        let manifest_desc = Descriptor::for_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &manifest);

        let mut inner = lock(&self.inner);
        inner.blobs.insert(digest_of(&layer), Bytes::from(layer));
        inner.blobs.insert(digest_of(&config), Bytes::from(config));
        inner.blobs.insert(manifest_desc.digest.clone(), Bytes::from(manifest));
        inner
            .tags
            .insert(reference.to_string(), manifest_desc.clone());

        Ok(manifest_desc)
    }

    /// Whether a reference is tagged in the registry.
    pub fn has_image(&self, reference: &str) -> bool {
        lock(&self.inner).tags.contains_key(reference)
    }

    fn connect(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable(format!(
                "registry {} unreachable",
                registry_host(reference)
            )));
        }

        let host = registry_host(reference);
        if !opts.plain_http && lock(&self.plain_http_hosts).contains(host) {
            return Err(RuntimeError::Unavailable(format!(
                "{host}: server gave HTTP response to HTTPS client"
            )));
        }

        Ok(())
    }

    fn resolve(&self, reference: &str) -> RuntimeResult<Descriptor> {
        lock(&self.inner)
            .tags
            .get(reference)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("{reference} not found in registry")))
    }

    fn blob(&self, digest: &str) -> RuntimeResult<Bytes> {
        lock(&self.inner)
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("blob {digest} not found in registry")))
    }

    fn upload(&self, reference: &str, target: Descriptor, blobs: Vec<(String, Bytes)>) {
        let mut inner = lock(&self.inner);
        for (digest, data) in blobs {
            inner.blobs.insert(digest, data);
        }
        inner.tags.insert(reference.to_string(), target);
    }
}

// =============================================================================
// Runtime state
// =============================================================================

struct StoredBlob {
    data: Bytes,
    labels: BTreeMap<String, String>,
}

struct Snapshot {
    parent: Option<String>,
    created_at: chrono::DateTime<Utc>,
    /// Entries of this layer. `None` is a whiteout.
    files: BTreeMap<String, Option<Vec<u8>>>,
    active: bool,
}

impl Snapshot {
    fn size(&self) -> u64 {
        self.files
            .values()
            .map(|f| f.as_ref().map_or(0, |d| d.len() as u64))
            .sum()
    }
}

struct Task {
    status: TaskStatus,
    pid: u32,
    started_at: Option<Instant>,
    exit: watch::Sender<Option<ExitStatus>>,
    process_state: Vec<u8>,
    restored_from: Option<String>,
}

#[derive(Default)]
struct Inner {
    images: HashMap<String, Image>,
    /// Top unpacked layer per image name.
    image_roots: HashMap<String, Option<String>>,
    blobs: HashMap<String, StoredBlob>,
    containers: BTreeMap<String, ContainerRecord>,
    /// Every snapshot revision each container has owned.
    owned_snapshots: HashMap<String, Vec<String>>,
    snapshots: HashMap<String, Snapshot>,
    tasks: HashMap<String, Task>,
}

impl Inner {
    fn blob(&self, digest: &str) -> RuntimeResult<Bytes> {
        self.blobs
            .get(digest)
            .map(|b| b.data.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("blob {digest}")))
    }

    fn task(&self, id: &str) -> RuntimeResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))
    }

    fn task_mut(&mut self, id: &str) -> RuntimeResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("task {id}")))
    }

    fn container(&self, id: &str) -> RuntimeResult<&ContainerRecord> {
        self.containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("container {id}")))
    }

    fn snapshot(&self, key: &str) -> RuntimeResult<&Snapshot> {
        self.snapshots
            .get(key)
            .ok_or_else(|| RuntimeError::NotFound(format!("snapshot {key}")))
    }

    fn active_snapshot_mut(&mut self, key: &str) -> RuntimeResult<&mut Snapshot> {
        let snapshot = self
            .snapshots
            .get_mut(key)
            .ok_or_else(|| RuntimeError::NotFound(format!("snapshot {key}")))?;
        if !snapshot.active {
            return Err(RuntimeError::FailedPrecondition(format!(
                "snapshot {key} is committed"
            )));
        }
        Ok(snapshot)
    }

    /// Resolve a path through the snapshot chain.
    fn read_path(&self, key: &str, path: &str) -> RuntimeResult<Option<Vec<u8>>> {
        let mut current = Some(key.to_string());
        while let Some(k) = current {
            let snapshot = self.snapshot(&k)?;
            if let Some(entry) = snapshot.files.get(path) {
                return Ok(entry.clone());
            }
            current = snapshot.parent.clone();
        }
        Ok(None)
    }

    /// Unpack manifest layers into committed snapshots; returns the top key.
    fn unpack(&mut self, manifest: &ImageManifest) -> RuntimeResult<Option<String>> {
        let mut parent: Option<String> = None;
        for layer in &manifest.layers {
            let key = match &parent {
                Some(p) => digest_of(format!("{p} {}", layer.digest).as_bytes()),
                None => layer.digest.clone(),
            };
            if !self.snapshots.contains_key(&key) {
                let data = self.blob(&layer.digest)?;
                let files = read_layer(&data)?.into_iter().collect();
                self.snapshots.insert(
                    key.clone(),
                    Snapshot {
                        parent: parent.clone(),
                        created_at: Utc::now(),
                        files,
                        active: false,
                    },
                );
            }
            parent = Some(key);
        }
        Ok(parent)
    }

    /// Digests reachable from `roots`, following GC labels and references.
    fn reachable_from<I>(&self, roots: I) -> HashSet<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let mut stack: Vec<String> = roots.into_iter().collect();

        while let Some(digest) = stack.pop() {
            if !seen.insert(digest.clone()) {
                continue;
            }
            let Some(blob) = self.blobs.get(&digest) else {
                continue;
            };
            stack.extend(
                blob.labels
                    .iter()
                    .filter(|(k, _)| k.starts_with(GC_REF_CONTENT_PREFIX))
                    .map(|(_, v)| v.clone()),
            );
            if let Ok(index) = CheckpointIndex::from_slice(&blob.data) {
                stack.extend(index.manifests.into_iter().map(|d| d.digest));
            } else if let Ok(manifest) = ImageManifest::from_slice(&blob.data) {
                stack.extend(manifest.children().map(|d| d.digest.clone()));
            }
        }

        seen
    }
}

/// Collect a descriptor and everything it references.
fn closure<F>(root: &Descriptor, get: F) -> RuntimeResult<Vec<(String, Bytes)>>
where
    F: Fn(&str) -> RuntimeResult<Bytes>,
{
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];

    while let Some(desc) = stack.pop() {
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        let data = get(&desc.digest)?;
        match desc.media_type.as_str() {
            MEDIA_TYPE_IMAGE_INDEX => stack.extend(CheckpointIndex::from_slice(&data)?.manifests),
            MEDIA_TYPE_IMAGE_MANIFEST => {
                stack.extend(ImageManifest::from_slice(&data)?.children().cloned())
            }
            _ => {}
        }
        out.push((desc.digest, data));
    }

    Ok(out)
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Encode layer entries as a gzip-compressed tar.
fn build_layer(files: &BTreeMap<String, Option<Vec<u8>>>) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for (path, content) in files {
        let relative = path.trim_start_matches('/');
        let (name, data): (String, &[u8]) = match content {
            Some(data) => (relative.to_string(), data.as_slice()),
            None => {
                let whiteout = match relative.rsplit_once('/') {
                    Some((dir, file)) => format!("{dir}/{WHITEOUT_PREFIX}{file}"),
                    None => format!("{WHITEOUT_PREFIX}{relative}"),
                };
                (whiteout, &[])
            }
        };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, name, data)?;
    }

    builder.into_inner()?.finish()
}

/// Decode a gzip-compressed tar layer into entries, whiteouts as `None`.
fn read_layer(data: &[u8]) -> io::Result<Vec<(String, Option<Vec<u8>>)>> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let (dir, file) = match path.rsplit_once('/') {
            Some((dir, file)) => (Some(dir.to_string()), file.to_string()),
            None => (None, path.clone()),
        };

        if let Some(deleted) = file.strip_prefix(WHITEOUT_PREFIX) {
            let target = match dir {
                Some(dir) => format!("{dir}/{deleted}"),
                None => deleted.to_string(),
            };
            entries.push((normalize_path(&target), None));
        } else {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            entries.push((normalize_path(&path), Some(buf)));
        }
    }

    Ok(entries)
}

// =============================================================================
// Runtime
// =============================================================================

/// In-memory runtime.
pub struct MemoryRuntime {
    registry: Arc<MemoryRegistry>,
    inner: Mutex<Inner>,
    next_pid: AtomicU32,
    /// Task-mutating calls served (create/start/pause/resume/kill/delete/checkpoint).
    task_calls: AtomicU64,
    /// Containers whose tasks ignore SIGTERM.
    ignore_terminate: Mutex<HashSet<String>>,
    fail_task_create: AtomicBool,
}

impl MemoryRuntime {
    /// Create a runtime backed by `registry`.
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        Self {
            registry,
            inner: Mutex::new(Inner::default()),
            next_pid: AtomicU32::new(1000),
            task_calls: AtomicU64::new(0),
            ignore_terminate: Mutex::new(HashSet::new()),
            fail_task_create: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    /// Number of task-mutating calls served so far.
    pub fn task_calls(&self) -> u64 {
        self.task_calls.load(Ordering::SeqCst)
    }

    /// Make tasks of container `id` ignore SIGTERM.
    pub fn ignore_terminate(&self, id: &str, ignore: bool) {
        let mut set = lock(&self.ignore_terminate);
        if ignore {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    /// Make every task creation fail.
    pub fn fail_task_create(&self, fail: bool) {
        self.fail_task_create.store(fail, Ordering::SeqCst);
    }

    /// Write a file into a container's writable layer.
    pub fn write_file(&self, id: &str, path: &str, data: &[u8]) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        let key = inner.container(id)?.snapshot_key.clone();
        inner
            .active_snapshot_mut(&key)?
            .files
            .insert(normalize_path(path), Some(data.to_vec()));
        Ok(())
    }

    /// Delete a file from a container's filesystem.
    pub fn remove_file(&self, id: &str, path: &str) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        let key = inner.container(id)?.snapshot_key.clone();
        inner
            .active_snapshot_mut(&key)?
            .files
            .insert(normalize_path(path), None);
        Ok(())
    }

    /// Read a file as the container sees it.
    pub fn read_file(&self, id: &str, path: &str) -> RuntimeResult<Option<Vec<u8>>> {
        let inner = lock(&self.inner);
        let key = inner.container(id)?.snapshot_key.clone();
        inner.read_path(&key, &normalize_path(path))
    }

    /// Replace the in-memory state of a live task.
    pub fn set_process_state(&self, id: &str, data: &[u8]) -> RuntimeResult<()> {
        lock(&self.inner).task_mut(id)?.process_state = data.to_vec();
        Ok(())
    }

    pub fn process_state(&self, id: &str) -> RuntimeResult<Vec<u8>> {
        Ok(lock(&self.inner).task(id)?.process_state.clone())
    }

    /// Digest of the checkpoint a task was restored from, if any.
    pub fn restored_from(&self, id: &str) -> RuntimeResult<Option<String>> {
        Ok(lock(&self.inner).task(id)?.restored_from.clone())
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        lock(&self.inner).blobs.contains_key(digest)
    }

    pub fn has_snapshot(&self, key: &str) -> bool {
        lock(&self.inner).snapshots.contains_key(key)
    }

    fn count_task_call(&self) {
        self.task_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn pull(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<Image> {
        self.registry.connect(reference, opts)?;
        let target = self.registry.resolve(reference)?;
        let blobs = closure(&target, |d| self.registry.blob(d))?;

        let mut inner = lock(&self.inner);
        for (digest, data) in blobs {
            inner.blobs.entry(digest).or_insert(StoredBlob {
                data,
                labels: BTreeMap::new(),
            });
        }

        if target.media_type == MEDIA_TYPE_IMAGE_MANIFEST {
            let manifest = ImageManifest::from_slice(&inner.blob(&target.digest)?)?;
            let root = inner.unpack(&manifest)?;
            inner.image_roots.insert(reference.to_string(), root);
        }

        let image = Image {
            name: reference.to_string(),
            target,
            created_at: Utc::now(),
        };
        inner.images.insert(reference.to_string(), image.clone());
        debug!(reference = %reference, plain_http = opts.plain_http, "[MEMORY] Pulled image");

        Ok(image)
    }

    async fn push(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<()> {
        self.registry.connect(reference, opts)?;

        let (target, blobs) = {
            let inner = lock(&self.inner);
            let image = inner
                .images
                .get(reference)
                .ok_or_else(|| RuntimeError::NotFound(format!("image {reference}")))?;
            let blobs = closure(&image.target, |d| inner.blob(d))?;
            (image.target.clone(), blobs)
        };

        debug!(reference = %reference, blobs = blobs.len(), "[MEMORY] Pushed image");
        self.registry.upload(reference, target, blobs);
        Ok(())
    }

    async fn fetch(&self, reference: &str, opts: RegistryOptions) -> RuntimeResult<Image> {
        self.registry.connect(reference, opts)?;
        let target = self.registry.resolve(reference)?;
        let blobs = closure(&target, |d| self.registry.blob(d))?;

        let mut inner = lock(&self.inner);
        for (digest, data) in blobs {
            inner.blobs.entry(digest).or_insert(StoredBlob {
                data,
                labels: BTreeMap::new(),
            });
        }

        Ok(Image {
            name: reference.to_string(),
            target,
            created_at: Utc::now(),
        })
    }

    async fn get_image(&self, name: &str) -> RuntimeResult<Image> {
        lock(&self.inner)
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("image {name}")))
    }

    async fn create_image(&self, image: Image) -> RuntimeResult<Image> {
        let mut inner = lock(&self.inner);
        if inner.images.contains_key(&image.name) {
            return Err(RuntimeError::AlreadyExists(format!("image {}", image.name)));
        }
        inner.blob(&image.target.digest)?;
        inner.images.insert(image.name.clone(), image.clone());
        Ok(image)
    }

    async fn delete_image(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        let removed = inner
            .images
            .remove(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("image {name}")))?;
        inner.image_roots.remove(name);

        // Collect content that only the removed image kept alive. Surviving
        // blobs (other images, freshly written indexes) keep their children.
        let orphaned = inner.reachable_from([removed.target.digest]);
        let roots: Vec<String> = inner
            .images
            .values()
            .map(|i| i.target.digest.clone())
            .chain(
                inner
                    .blobs
                    .keys()
                    .filter(|digest| !orphaned.contains(*digest))
                    .cloned(),
            )
            .collect();
        let alive = inner.reachable_from(roots);
        inner
            .blobs
            .retain(|digest, _| !orphaned.contains(digest) || alive.contains(digest));

        Ok(())
    }

    async fn write_blob(
        &self,
        media_type: &str,
        data: Bytes,
        labels: BTreeMap<String, String>,
    ) -> RuntimeResult<Descriptor> {
        let descriptor = Descriptor::for_bytes(media_type, &data);
        let mut inner = lock(&self.inner);
        let entry = inner
            .blobs
            .entry(descriptor.digest.clone())
            .or_insert(StoredBlob {
                data,
                labels: BTreeMap::new(),
            });
        entry.labels.extend(labels);
        Ok(descriptor)
    }

    async fn read_blob(&self, digest: &str) -> RuntimeResult<Bytes> {
        lock(&self.inner).blob(digest)
    }

    async fn create_container(&self, mut record: ContainerRecord) -> RuntimeResult<ContainerRecord> {
        let mut inner = lock(&self.inner);
        if inner.containers.contains_key(&record.id) {
            return Err(RuntimeError::AlreadyExists(format!("container {}", record.id)));
        }
        inner.snapshot(&record.snapshot_key)?;

        let now = Utc::now();
        record.created_at = now;
        record.updated_at = now;
        inner
            .owned_snapshots
            .entry(record.id.clone())
            .or_default()
            .push(record.snapshot_key.clone());
        inner.containers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn load_container(&self, id: &str) -> RuntimeResult<ContainerRecord> {
        lock(&self.inner).container(id).cloned()
    }

    async fn update_container(&self, mut record: ContainerRecord) -> RuntimeResult<ContainerRecord> {
        let mut inner = lock(&self.inner);
        let existing = inner.container(&record.id)?.clone();

        if existing.snapshot_key != record.snapshot_key {
            inner.snapshot(&record.snapshot_key)?;
            let owned = inner.owned_snapshots.entry(record.id.clone()).or_default();
            if !owned.contains(&record.snapshot_key) {
                owned.push(record.snapshot_key.clone());
            }
        }

        record.created_at = existing.created_at;
        record.updated_at = Utc::now();
        inner.containers.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn delete_container(&self, id: &str, gc_snapshots: bool) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        inner.container(id)?;
        if inner.tasks.contains_key(id) {
            return Err(RuntimeError::FailedPrecondition(format!(
                "container {id} still has a task"
            )));
        }

        inner.containers.remove(id);
        let owned = inner.owned_snapshots.remove(id).unwrap_or_default();
        if gc_snapshots {
            for key in owned {
                inner.snapshots.remove(&key);
            }
        }
        Ok(())
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerRecord>> {
        Ok(lock(&self.inner).containers.values().cloned().collect())
    }

    async fn prepare_snapshot(&self, key: &str, image: &str) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        if inner.snapshots.contains_key(key) {
            return Err(RuntimeError::AlreadyExists(format!("snapshot {key}")));
        }
        let parent = inner
            .image_roots
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("unpacked image {image}")))?;

        inner.snapshots.insert(
            key.to_string(),
            Snapshot {
                parent,
                created_at: Utc::now(),
                files: BTreeMap::new(),
                active: true,
            },
        );
        Ok(())
    }

    async fn snapshot_usage(&self, key: &str) -> RuntimeResult<u64> {
        Ok(lock(&self.inner).snapshot(key)?.size())
    }

    async fn walk_snapshots(&self, key: &str) -> RuntimeResult<Vec<SnapshotInfo>> {
        let inner = lock(&self.inner);
        let mut chain = Vec::new();
        let mut current = Some(key.to_string());

        while let Some(k) = current {
            let snapshot = inner.snapshot(&k)?;
            chain.push(SnapshotInfo {
                key: k.clone(),
                parent: snapshot.parent.clone(),
                created_at: snapshot.created_at,
                size: snapshot.size(),
            });
            current = snapshot.parent.clone();
        }

        Ok(chain)
    }

    async fn diff_snapshot(&self, key: &str) -> RuntimeResult<Descriptor> {
        let mut inner = lock(&self.inner);
        let layer = build_layer(&inner.snapshot(key)?.files)?;
        let descriptor = Descriptor::for_bytes(MEDIA_TYPE_LAYER_GZIP, &layer);
        inner
            .blobs
            .entry(descriptor.digest.clone())
            .or_insert(StoredBlob {
                data: Bytes::from(layer),
                labels: BTreeMap::new(),
            });
        Ok(descriptor)
    }

    async fn apply_diff(&self, key: &str, layer: &Descriptor) -> RuntimeResult<()> {
        let mut inner = lock(&self.inner);
        let data = inner.blob(&layer.digest)?;
        layer.verify(&data)?;
        let entries = read_layer(&data)?;
        let snapshot = inner.active_snapshot_mut(key)?;
        snapshot.files.extend(entries);
        Ok(())
    }

    async fn create_task(&self, id: &str, opts: CreateTaskOptions) -> RuntimeResult<()> {
        self.count_task_call();
        if self.fail_task_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("shim failed to start".to_string()));
        }

        let mut inner = lock(&self.inner);
        inner.container(id)?;
        if inner.tasks.contains_key(id) {
            return Err(RuntimeError::AlreadyExists(format!("task {id}")));
        }

        let (process_state, restored_from) = match opts.checkpoint {
            Some(checkpoint) => (
                inner.blob(&checkpoint.digest)?.to_vec(),
                Some(checkpoint.digest),
            ),
            None => (Vec::new(), None),
        };

        let (exit, _) = watch::channel(None);
        inner.tasks.insert(
            id.to_string(),
            Task {
                status: TaskStatus::Created,
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                started_at: None,
                exit,
                process_state,
                restored_from,
            },
        );
        Ok(())
    }

    async fn start_task(&self, id: &str) -> RuntimeResult<()> {
        self.count_task_call();
        let mut inner = lock(&self.inner);
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Created {
            return Err(RuntimeError::FailedPrecondition(format!(
                "task {id} is {}",
                task.status
            )));
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Instant::now());
        debug!(container_id = %id, pid = task.pid, "[MEMORY] Task started");
        Ok(())
    }

    async fn task_status(&self, id: &str) -> RuntimeResult<TaskStatus> {
        Ok(lock(&self.inner).task(id)?.status)
    }

    async fn pause_task(&self, id: &str) -> RuntimeResult<()> {
        self.count_task_call();
        let mut inner = lock(&self.inner);
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(RuntimeError::FailedPrecondition(format!(
                "cannot pause task {id} in state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Paused;
        Ok(())
    }

    async fn resume_task(&self, id: &str) -> RuntimeResult<()> {
        self.count_task_call();
        let mut inner = lock(&self.inner);
        let task = inner.task_mut(id)?;
        if task.status != TaskStatus::Paused {
            return Err(RuntimeError::FailedPrecondition(format!(
                "cannot resume task {id} in state {}",
                task.status
            )));
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    async fn kill_task(&self, id: &str, signal: Signal) -> RuntimeResult<()> {
        self.count_task_call();
        let ignores_term = lock(&self.ignore_terminate).contains(id);

        let mut inner = lock(&self.inner);
        let task = inner.task_mut(id)?;
        if task.status == TaskStatus::Stopped {
            return Ok(());
        }
        if signal == Signal::Terminate && ignores_term {
            debug!(container_id = %id, "[MEMORY] Task ignored SIGTERM");
            return Ok(());
        }

        task.status = TaskStatus::Stopped;
        task.exit.send_replace(Some(ExitStatus {
            code: 128 + signal.number(),
            exited_at: Utc::now(),
        }));
        Ok(())
    }

    async fn wait_task(&self, id: &str) -> RuntimeResult<ExitStatus> {
        let mut exit = lock(&self.inner).task(id)?.exit.subscribe();
        let status = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound(format!("task {id}")))?;
        status.ok_or_else(|| RuntimeError::Other(format!("task {id} exit status missing")))
    }

    async fn delete_task(&self, id: &str) -> RuntimeResult<ExitStatus> {
        self.count_task_call();
        let mut inner = lock(&self.inner);
        let task = inner.task(id)?;
        if task.status.is_live() {
            return Err(RuntimeError::FailedPrecondition(format!(
                "task {id} is {}",
                task.status
            )));
        }
        let exit = *task.exit.borrow();
        inner.tasks.remove(id);
        Ok(exit.unwrap_or(ExitStatus {
            code: 0,
            exited_at: Utc::now(),
        }))
    }

    async fn task_metrics(&self, id: &str) -> RuntimeResult<TaskMetrics> {
        let inner = lock(&self.inner);
        let task = inner.task(id)?;
        if !task.status.is_live() {
            return Err(RuntimeError::FailedPrecondition(format!(
                "task {id} is {}",
                task.status
            )));
        }
        let limit = inner.container(id)?.spec.resources.memory_limit;

        Ok(TaskMetrics {
            cpu_total_ns: task
                .started_at
                .map_or(0, |t| t.elapsed().as_nanos() as u64),
            memory_usage: BASE_MEMORY_USAGE + task.process_state.len() as u64,
            memory_cache: BASE_MEMORY_CACHE,
            memory_limit: limit,
            pids_current: 1,
            pids_limit: DEFAULT_PIDS_LIMIT,
        })
    }

    async fn checkpoint_task(&self, id: &str) -> RuntimeResult<Vec<Descriptor>> {
        self.count_task_call();
        let mut inner = lock(&self.inner);
        let task = inner.task(id)?;
        if !task.status.is_live() {
            return Err(RuntimeError::FailedPrecondition(format!(
                "cannot checkpoint task {id} in state {}",
                task.status
            )));
        }
        let state = Bytes::from(task.process_state.clone());
        let config = serde_json::to_vec(&inner.container(id)?.spec)
            .map_err(|e| RuntimeError::Other(e.to_string()))?;

        let criu = Descriptor::for_bytes(MEDIA_TYPE_CHECKPOINT_CRIU, &state);
        let config_desc = Descriptor::for_bytes(MEDIA_TYPE_CHECKPOINT_CONFIG, &config);
        for (desc, data) in [(&criu, state), (&config_desc, Bytes::from(config))] {
            inner
                .blobs
                .entry(desc.digest.clone())
                .or_insert(StoredBlob {
                    data,
                    labels: BTreeMap::new(),
                });
        }

        Ok(vec![criu, config_desc])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = "registry.local/app:v1";

    async fn runtime_with_container(id: &str) -> MemoryRuntime {
        let registry = MemoryRegistry::new();
        registry
            .publish_image(IMAGE, &[("/etc/os-release", b"berth"), ("/bin/app", b"\x7fELF")])
            .unwrap();
        let runtime = MemoryRuntime::new(registry);
        runtime.pull(IMAGE, RegistryOptions::default()).await.unwrap();
        runtime.prepare_snapshot(id, IMAGE).await.unwrap();
        runtime
            .create_container(ContainerRecord {
                id: id.to_string(),
                image: IMAGE.to_string(),
                snapshot_key: id.to_string(),
                spec: Default::default(),
                labels: BTreeMap::new(),
                extensions: BTreeMap::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        runtime
    }

    #[test]
    fn test_layer_roundtrip_with_whiteouts() {
        let mut files = BTreeMap::new();
        files.insert("/etc/app.conf".to_string(), Some(b"port=80".to_vec()));
        files.insert("/etc/os-release".to_string(), None);
        files.insert("/top".to_string(), None);

        let entries = read_layer(&build_layer(&files).unwrap()).unwrap();
        let decoded: BTreeMap<_, _> = entries.into_iter().collect();
        assert_eq!(decoded, files);
    }

    #[tokio::test]
    async fn test_reads_resolve_through_layers() {
        let runtime = runtime_with_container("web").await;

        assert_eq!(
            runtime.read_file("web", "/etc/os-release").unwrap(),
            Some(b"berth".to_vec())
        );

        runtime.remove_file("web", "/etc/os-release").unwrap();
        runtime.write_file("web", "/data/state", b"42").unwrap();

        assert_eq!(runtime.read_file("web", "/etc/os-release").unwrap(), None);
        assert_eq!(runtime.read_file("web", "data/state").unwrap(), Some(b"42".to_vec()));
        assert_eq!(runtime.snapshot_usage("web").await.unwrap(), 2);

        let chain = runtime.walk_snapshots("web").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].key, "web");
        assert!(chain[1].parent.is_none());
    }

    #[tokio::test]
    async fn test_plain_http_registry_requires_opt_in() {
        let registry = MemoryRegistry::new();
        registry.serve_plain_http("registry.local");
        registry.publish_image(IMAGE, &[("/a", b"a")]).unwrap();
        let runtime = MemoryRuntime::new(registry);

        let err = runtime.pull(IMAGE, RegistryOptions::default()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));

        runtime
            .pull(IMAGE, RegistryOptions { plain_http: true })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let runtime = runtime_with_container("web").await;

        runtime.create_task("web", CreateTaskOptions::default()).await.unwrap();
        assert_eq!(runtime.task_status("web").await.unwrap(), TaskStatus::Created);
        runtime.start_task("web").await.unwrap();
        runtime.pause_task("web").await.unwrap();
        assert!(runtime.delete_task("web").await.is_err());
        runtime.resume_task("web").await.unwrap();

        runtime.kill_task("web", Signal::Terminate).await.unwrap();
        let exit = runtime.wait_task("web").await.unwrap();
        assert_eq!(exit.code, 143);

        // Signalling an exited task is harmless.
        runtime.kill_task("web", Signal::Kill).await.unwrap();
        runtime.delete_task("web").await.unwrap();
        assert!(runtime.task_status("web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ignored_sigterm_keeps_task_running() {
        let runtime = runtime_with_container("web").await;
        runtime.ignore_terminate("web", true);
        runtime.create_task("web", CreateTaskOptions::default()).await.unwrap();
        runtime.start_task("web").await.unwrap();

        runtime.kill_task("web", Signal::Terminate).await.unwrap();
        assert_eq!(runtime.task_status("web").await.unwrap(), TaskStatus::Running);

        runtime.kill_task("web", Signal::Kill).await.unwrap();
        assert_eq!(runtime.wait_task("web").await.unwrap().code, 137);
    }

    #[tokio::test]
    async fn test_delete_container_collects_snapshots() {
        let runtime = runtime_with_container("web").await;
        runtime.delete_container("web", true).await.unwrap();

        assert!(!runtime.has_snapshot("web"));
        assert!(runtime.load_container("web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_image_keeps_shared_content() {
        let runtime = runtime_with_container("web").await;
        let shared = runtime
            .write_blob("application/octet-stream", Bytes::from_static(b"shared"), BTreeMap::new())
            .await
            .unwrap();
        let only_old = runtime
            .write_blob("application/octet-stream", Bytes::from_static(b"old"), BTreeMap::new())
            .await
            .unwrap();

        let mut old = CheckpointIndex::new();
        old.push(shared.clone());
        old.push(only_old.clone());
        let (old_desc, old_data) = old.descriptor().unwrap();
        runtime
            .write_blob(MEDIA_TYPE_IMAGE_INDEX, Bytes::from(old_data), BTreeMap::new())
            .await
            .unwrap();
        runtime
            .create_image(Image {
                name: "cp".to_string(),
                target: old_desc.clone(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        // A new index written but not yet registered keeps its children.
        let mut new = CheckpointIndex::new();
        new.push(shared.clone());
        let (new_desc, new_data) = new.descriptor().unwrap();
        runtime
            .write_blob(MEDIA_TYPE_IMAGE_INDEX, Bytes::from(new_data), BTreeMap::new())
            .await
            .unwrap();

        runtime.delete_image("cp").await.unwrap();

        assert!(!runtime.has_blob(&old_desc.digest));
        assert!(!runtime.has_blob(&only_old.digest));
        assert!(runtime.has_blob(&new_desc.digest));
        assert!(runtime.has_blob(&shared.digest));
    }

    #[tokio::test]
    async fn test_checkpoint_task_includes_runtime_config() {
        let runtime = runtime_with_container("web").await;
        runtime.create_task("web", CreateTaskOptions::default()).await.unwrap();
        runtime.start_task("web").await.unwrap();
        runtime.set_process_state("web", b"counter=7").unwrap();

        let descriptors = runtime.checkpoint_task("web").await.unwrap();
        let media_types: Vec<_> = descriptors.iter().map(|d| d.media_type.as_str()).collect();
        assert_eq!(
            media_types,
            vec![MEDIA_TYPE_CHECKPOINT_CRIU, MEDIA_TYPE_CHECKPOINT_CONFIG]
        );
        assert_eq!(
            runtime.read_blob(&descriptors[0].digest).await.unwrap(),
            Bytes::from_static(b"counter=7")
        );
    }
}
