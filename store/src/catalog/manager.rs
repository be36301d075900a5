//! The catalog tree and its lazy loading.
//!
//! Catalogs form a tree rooted at the repository root catalog. They are
//! modeled as an arena of slots addressed by dense indices; parent/child
//! links are indices, the manager owns every slot. A nested catalog is
//! attached when a path crossing its mountpoint is resolved, and its root
//! entry is reconciled against the parent's mountpoint entry before the
//! slot becomes active.
//!
//! Every active catalog owns a contiguous inode range, granted when it
//! enters the tree and retired (never reused) when it leaves. The low part
//! of the range maps row ids, the upper part hardlink groups, so two
//! entries share an inode exactly when they share a hardlink group of the
//! same catalog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use stratofs_castore::{
    DownloadError, FetchError, Fetcher, ManifestSource, ObjectDigest, ObjectKind,
};

use super::{Catalog, CatalogError, QueryContext};
use crate::caches::MetaCaches;
use crate::dirent::DirectoryEntry;
use crate::manifest::{Manifest, ManifestError, ManifestVerifier};
use crate::path_hash::{parent_path, PathHash};

/// The repository root, hashed as the empty path.
pub const ROOT_PATH: &str = "";

/// First inode handed out; lower numbers stay reserved for the kernel
/// side.
const INITIAL_INODE: u64 = 256;

/// Fallback TTL when the manifest does not advertise one.
const DEFAULT_TTL: Duration = Duration::from_secs(240);

/// Lower bound on the background refresh interval.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("inconsistent catalog hierarchy: {0}")]
    Inconsistent(String),
}

impl From<DownloadError> for ManagerError {
    fn from(value: DownloadError) -> Self {
        ManagerError::Fetch(value.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Loading,
    Active,
    Detaching,
    Unloaded,
}

struct Slot {
    mountpoint: String,
    digest: ObjectDigest,
    parent: Option<usize>,
    children: Vec<usize>,
    state: SlotState,
    catalog: Option<Arc<Catalog>>,
    inode_base: u64,
    inode_span: u64,
    row_count: u64,
    last_access_ms: AtomicU64,
}

impl Slot {
    fn is_active(&self) -> bool {
        self.state == SlotState::Active
    }

    fn catalog(&self) -> &Arc<Catalog> {
        self.catalog
            .as_ref()
            .expect("active slot must hold a catalog")
    }

    fn covers_inode(&self, inode: u64) -> bool {
        self.is_active() && inode >= self.inode_base && inode < self.inode_base + self.inode_span
    }

    /// Inode of the entry at `rowid`, folding hardlink groups into the
    /// upper half of the slot's range so group members share an inode.
    fn inode_for(&self, rowid: u64, hardlink_group: u32) -> u64 {
        if hardlink_group == 0 {
            self.inode_base + rowid
        } else {
            self.inode_base + self.row_count + hardlink_group as u64
        }
    }

    fn touch(&self, epoch: &Instant) {
        self.last_access_ms
            .store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct CatalogTree {
    slots: Vec<Slot>,
}

impl CatalogTree {
    /// Index of the deepest active catalog whose mountpoint is a prefix of
    /// `path`. Requires the root slot to be present.
    fn deepest_active(&self, path: &str) -> usize {
        let mut current = 0;
        'descend: loop {
            for &child in &self.slots[current].children {
                let slot = &self.slots[child];
                if slot.is_active() && mountpoint_covers(&slot.mountpoint, path) {
                    current = child;
                    continue 'descend;
                }
            }
            return current;
        }
    }

    fn active_child_at(&self, parent: usize, mountpoint: &str) -> Option<usize> {
        self.slots[parent]
            .children
            .iter()
            .copied()
            .find(|&c| self.slots[c].is_active() && self.slots[c].mountpoint == mountpoint)
    }
}

/// `mountpoint` covers `path` if it is `path` itself or a directory
/// prefix of it. The root mountpoint covers everything.
fn mountpoint_covers(mountpoint: &str, path: &str) -> bool {
    if mountpoint.is_empty() {
        return true;
    }
    path == mountpoint
        || (path.starts_with(mountpoint) && path.as_bytes()[mountpoint.len()] == b'/')
}

/// Loads the root catalog via the signed manifest, attaches and detaches
/// nested catalogs on traversal, assigns stable inode ranges and swaps the
/// whole tree when the trusted root digest changes.
pub struct CatalogManager {
    fetcher: Arc<Fetcher>,
    manifest_source: Arc<dyn ManifestSource>,
    verifier: ManifestVerifier,
    context: Arc<QueryContext>,
    caches: Arc<MetaCaches>,
    max_ttl: Option<Duration>,
    /// Pinned trusted root; disables manifest refresh.
    root_pin: Option<ObjectDigest>,

    tree: RwLock<CatalogTree>,
    next_inode_base: AtomicU64,
    current_manifest: parking_lot::Mutex<Option<Manifest>>,
    generation: AtomicU64,
    attaches: AtomicU64,
    epoch: Instant,
}

impl CatalogManager {
    /// Establishes the trusted root (from the pinned hash or a verified
    /// manifest) and loads the root catalog.
    pub async fn mount(
        fetcher: Arc<Fetcher>,
        manifest_source: Arc<dyn ManifestSource>,
        verifier: ManifestVerifier,
        context: Arc<QueryContext>,
        caches: Arc<MetaCaches>,
        root_pin: Option<ObjectDigest>,
        max_ttl: Option<Duration>,
    ) -> Result<Arc<Self>, ManagerError> {
        let mgr = Arc::new(Self {
            fetcher,
            manifest_source,
            verifier,
            context,
            caches,
            max_ttl,
            root_pin,
            tree: RwLock::new(CatalogTree::default()),
            next_inode_base: AtomicU64::new(INITIAL_INODE),
            current_manifest: parking_lot::Mutex::new(None),
            generation: AtomicU64::new(0),
            attaches: AtomicU64::new(0),
            epoch: Instant::now(),
        });

        let root_digest = match mgr.root_pin {
            Some(digest) => digest,
            None => {
                let text = mgr.manifest_source.fetch_manifest().await?;
                let mut manifest = mgr.verifier.verify(&text, None)?;
                mgr.clamp_ttl(&mut manifest);
                let digest = manifest.root_catalog;
                *mgr.current_manifest.lock() = Some(manifest);
                digest
            }
        };

        let root_slot = mgr.build_root_slot(root_digest).await?;
        mgr.tree.write().await.slots.push(root_slot);
        info!(root.digest=%root_digest, "root catalog loaded");
        Ok(mgr)
    }

    /// The generation counter; bumped on every root swap.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// How often a nested or root catalog has been attached.
    pub fn catalog_attaches(&self) -> u64 {
        self.attaches.load(Ordering::Relaxed)
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.current_manifest.lock().clone()
    }

    pub async fn root_digest(&self) -> ObjectDigest {
        self.tree.read().await.slots[0].digest
    }

    pub async fn revision(&self) -> u64 {
        self.tree.read().await.slots[0].catalog().revision()
    }

    pub async fn loaded_catalogs(&self) -> usize {
        self.tree
            .read()
            .await
            .slots
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    /// Resolves an absolute path to its directory entry, attaching nested
    /// catalogs along the way. `Ok(None)` is a definitive negative.
    #[instrument(skip(self), err)]
    pub async fn lookup_path(&self, path: &str) -> Result<Option<DirectoryEntry>, ManagerError> {
        let hash = PathHash::of(path);
        loop {
            {
                let tree = self.tree.read().await;
                let slot_idx = tree.deepest_active(path);
                let slot = &tree.slots[slot_idx];
                slot.touch(&self.epoch);

                match slot.catalog().lookup_path_hash(&hash)? {
                    Some((_, entry)) if entry.is_nested_mountpoint && path != slot.mountpoint => {
                        // the subtree continues in a child catalog that is
                        // not attached yet; fall through to the slow path
                        debug!(mountpoint = path, "crossing unloaded nested catalog");
                    }
                    Some((rowid, mut entry)) => {
                        entry.inode = slot.inode_for(rowid, entry.hardlink_group());
                        return Ok(Some(entry));
                    }
                    None => {
                        // the path may live below a not-yet-attached
                        // mountpoint deeper in this catalog
                        if self.unloaded_mountpoint_for(slot, path)?.is_none() {
                            return Ok(None);
                        }
                    }
                }
            }

            if !self.attach_next(path).await? {
                return Err(ManagerError::Inconsistent(format!(
                    "mountpoint without nested catalog reference on the way to {:?}",
                    path
                )));
            }
        }
    }

    /// Children of the directory at `path`, in on-disk order. `Ok(None)`
    /// if the path does not name a directory.
    #[instrument(skip(self), err)]
    pub async fn listing(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, ManagerError> {
        loop {
            {
                let tree = self.tree.read().await;
                let slot_idx = tree.deepest_active(path);
                let slot = &tree.slots[slot_idx];
                slot.touch(&self.epoch);

                // children of a mountpoint live in the child catalog
                let needs_child = path != slot.mountpoint
                    && slot.catalog().lookup_nested(path)?.is_some()
                    && tree.active_child_at(slot_idx, path).is_none();
                let crosses_unloaded = !needs_child
                    && self.unloaded_mountpoint_for(slot, parent_path(path))?.is_some();

                if !needs_child && !crosses_unloaded {
                    let rows = slot.catalog().listing(&PathHash::of(path))?;
                    if rows.is_empty() {
                        match slot.catalog().lookup_path_hash(&PathHash::of(path))? {
                            Some((_, entry))
                                if entry.kind == crate::dirent::EntryKind::Directory =>
                            {
                                return Ok(Some(vec![]))
                            }
                            _ if path == ROOT_PATH => return Ok(Some(vec![])),
                            _ => return Ok(None),
                        }
                    }
                    let entries = rows
                        .into_iter()
                        .map(|(rowid, mut entry)| {
                            entry.inode = slot.inode_for(rowid, entry.hardlink_group());
                            entry
                        })
                        .collect();
                    return Ok(Some(entries));
                }
            }

            if !self.attach_next(path).await? {
                return Err(ManagerError::Inconsistent(format!(
                    "mountpoint without nested catalog reference on the way to {:?}",
                    path
                )));
            }
        }
    }

    /// Resolves an inode back to its entry via the owning slot's range.
    /// `Ok(None)` means the inode belongs to no loaded catalog (e.g. a
    /// handle that outlived a root swap).
    pub async fn entry_by_inode(&self, inode: u64) -> Result<Option<DirectoryEntry>, ManagerError> {
        let tree = self.tree.read().await;
        let Some(slot) = tree.slots.iter().find(|s| s.covers_inode(inode)) else {
            return Ok(None);
        };
        slot.touch(&self.epoch);

        let rel = inode - slot.inode_base;
        let found = if rel <= slot.row_count {
            slot.catalog().lookup_rowid(rel)?
        } else {
            slot.catalog()
                .lookup_hardlink_group((rel - slot.row_count) as u32)?
        };
        Ok(found.map(|(_, mut entry)| {
            entry.inode = inode;
            entry
        }))
    }

    /// Re-fetches the manifest and swaps in a new root catalog if the
    /// trusted root digest changed. Returns whether a swap happened.
    /// Failures leave the previously accepted root in force.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<bool, ManagerError> {
        if self.root_pin.is_some() {
            return Ok(false);
        }

        let text = self.manifest_source.fetch_manifest().await?;
        let last = self.current_manifest.lock().clone();
        let mut manifest = self.verifier.verify(&text, last.as_ref())?;
        self.clamp_ttl(&mut manifest);

        let changed = last
            .map(|l| l.root_catalog != manifest.root_catalog)
            .unwrap_or(true);
        if !changed {
            *self.current_manifest.lock() = Some(manifest);
            return Ok(false);
        }

        // build the new root outside the tree lock; if its catalog is
        // unreachable we keep serving the previous tree
        let root_slot = self.build_root_slot(manifest.root_catalog).await?;
        let new_digest = root_slot.digest;

        let old = {
            let mut tree = self.tree.write().await;
            std::mem::replace(
                &mut *tree,
                CatalogTree {
                    slots: vec![root_slot],
                },
            )
        };
        for slot in &old.slots {
            if slot.is_active() {
                if let Err(e) = self.fetcher.quota().unpin(&slot.digest) {
                    warn!(err=%e, "unable to unpin detached catalog");
                }
            }
        }
        // new requests see the new tree only; cached metadata of the old
        // tree is dropped wholesale
        self.caches.drop_all();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.current_manifest.lock() = Some(manifest);
        info!(root.digest=%new_digest, "root catalog swapped");
        Ok(true)
    }

    /// Detaches least-recently-used nested catalogs until at most
    /// `max_loaded` catalogs stay active.
    pub async fn detach_idle(&self, max_loaded: usize) {
        let mut tree = self.tree.write().await;
        loop {
            let active = tree.slots.iter().filter(|s| s.is_active()).count();
            if active <= max_loaded.max(1) {
                return;
            }

            // detachable: active leaves, never the root
            let Some(victim) = tree
                .slots
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(idx, s)| {
                    s.is_active()
                        && !s
                            .children
                            .iter()
                            .any(|&c| tree.slots[c].is_active())
                        && *idx != 0
                })
                .min_by_key(|(_, s)| s.last_access_ms.load(Ordering::Relaxed))
                .map(|(idx, _)| idx)
            else {
                return;
            };

            let digest = {
                let slot = &mut tree.slots[victim];
                slot.state = SlotState::Detaching;
                slot.catalog = None;
                slot.state = SlotState::Unloaded;
                slot.digest
            };
            if let Some(parent) = tree.slots[victim].parent {
                tree.slots[parent].children.retain(|&c| c != victim);
            }
            if let Err(e) = self.fetcher.quota().unpin(&digest) {
                warn!(err=%e, "unable to unpin detached catalog");
            }
            // inodes of the retired range must not linger in the caches
            self.caches.drop_all();
            debug!(catalog.digest=%digest, "nested catalog detached");
        }
    }

    /// Periodic manifest refresh, every TTL/2 (bounded below). Errors are
    /// logged and the previous root stays in use.
    pub fn spawn_refresh_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(mgr.refresh_interval()).await;
                match mgr.refresh().await {
                    Ok(true) => {}
                    Ok(false) => debug!("manifest refresh: root unchanged"),
                    Err(e) => warn!(err=%e, "manifest refresh failed, keeping previous root"),
                }
            }
        })
    }

    fn refresh_interval(&self) -> Duration {
        let ttl = self
            .current_manifest
            .lock()
            .as_ref()
            .map(|m| m.ttl)
            .unwrap_or(DEFAULT_TTL);
        std::cmp::max(ttl / 2, MIN_REFRESH_INTERVAL)
    }

    fn clamp_ttl(&self, manifest: &mut Manifest) {
        if manifest.ttl.is_zero() {
            manifest.ttl = DEFAULT_TTL;
        }
        if let Some(max) = self.max_ttl {
            manifest.ttl = std::cmp::min(manifest.ttl, max);
        }
    }

    /// The shallowest nested-catalog mountpoint of `slot` lying on the way
    /// to `path` that has no active child yet.
    fn unloaded_mountpoint_for(
        &self,
        slot: &Slot,
        path: &str,
    ) -> Result<Option<(String, ObjectDigest)>, ManagerError> {
        // ancestors of `path` strictly below the slot's mountpoint, from
        // shallowest to deepest
        let mut ancestors = Vec::new();
        let mut current = path;
        while current.len() > slot.mountpoint.len() {
            ancestors.push(current);
            current = parent_path(current);
        }
        for ancestor in ancestors.into_iter().rev() {
            if let Some(digest) = slot.catalog().lookup_nested(ancestor)? {
                return Ok(Some((ancestor.to_string(), digest)));
            }
        }
        Ok(None)
    }

    /// Slow path of traversal: attaches the next catalog on the way to
    /// `path`. Returns false if there is nothing left to attach.
    async fn attach_next(&self, path: &str) -> Result<bool, ManagerError> {
        let mut tree = self.tree.write().await;
        let slot_idx = tree.deepest_active(path);
        let next = self.unloaded_mountpoint_for(&tree.slots[slot_idx], path)?;
        let Some((mountpoint, digest)) = next else {
            return Ok(false);
        };
        // a concurrent traversal may have won the race
        if tree.active_child_at(slot_idx, &mountpoint).is_some() {
            return Ok(true);
        }
        self.attach_nested(&mut tree, slot_idx, mountpoint, digest)
            .await?;
        Ok(true)
    }

    async fn attach_nested(
        &self,
        tree: &mut CatalogTree,
        parent_idx: usize,
        mountpoint: String,
        digest: ObjectDigest,
    ) -> Result<usize, ManagerError> {
        if digest.is_null() {
            return Err(ManagerError::Inconsistent(format!(
                "nested catalog at {:?} has no digest",
                mountpoint
            )));
        }

        let mountpoint_hash = PathHash::of(&mountpoint);
        let parent_entry = tree.slots[parent_idx]
            .catalog()
            .lookup_path_hash(&mountpoint_hash)?
            .map(|(_, entry)| entry)
            .ok_or_else(|| {
                ManagerError::Inconsistent(format!(
                    "mountpoint {:?} missing in parent catalog",
                    mountpoint
                ))
            })?;
        if !parent_entry.is_nested_mountpoint {
            return Err(ManagerError::Inconsistent(format!(
                "{:?} is referenced as nested catalog but not flagged as mountpoint",
                mountpoint
            )));
        }

        let slot_idx = tree.slots.len();
        tree.slots.push(Slot {
            mountpoint: mountpoint.clone(),
            digest,
            parent: Some(parent_idx),
            children: vec![],
            state: SlotState::Loading,
            catalog: None,
            inode_base: 0,
            inode_span: 0,
            row_count: 0,
            last_access_ms: AtomicU64::new(self.epoch.elapsed().as_millis() as u64),
        });

        match self.load_catalog(&digest).await {
            Ok(catalog) => {
                // the child's root entry must agree with the parent's
                // mountpoint entry
                let child_root = catalog
                    .lookup_path_hash(&mountpoint_hash)?
                    .map(|(_, entry)| entry);
                let consistent = match &child_root {
                    Some(entry) => entry.is_nested_root && entry.stat_matches(&parent_entry),
                    None => false,
                };
                if !consistent {
                    tree.slots[slot_idx].state = SlotState::Unloaded;
                    if let Err(e) = self.fetcher.quota().unpin(&digest) {
                        warn!(err=%e, "unable to unpin rejected catalog");
                    }
                    return Err(ManagerError::Inconsistent(format!(
                        "root entry of nested catalog {:?} does not match its mountpoint",
                        mountpoint
                    )));
                }

                let row_count = catalog.row_count();
                let span = 2 * (row_count + 1);
                let base = self.next_inode_base.fetch_add(span, Ordering::SeqCst);

                let slot = &mut tree.slots[slot_idx];
                slot.catalog = Some(Arc::new(catalog));
                slot.row_count = row_count;
                slot.inode_base = base;
                slot.inode_span = span;
                slot.state = SlotState::Active;
                tree.slots[parent_idx].children.push(slot_idx);
                self.attaches.fetch_add(1, Ordering::Relaxed);
                debug!(mountpoint = %mountpoint, catalog.digest=%digest, "nested catalog attached");
                Ok(slot_idx)
            }
            Err(e) => {
                tree.slots[slot_idx].state = SlotState::Unloaded;
                Err(e)
            }
        }
    }

    async fn build_root_slot(&self, digest: ObjectDigest) -> Result<Slot, ManagerError> {
        let catalog = self.load_catalog(&digest).await?;

        // the root entry is the directory the whole tree hangs off
        let root_entry = catalog
            .lookup_path_hash(&PathHash::of(ROOT_PATH))?
            .map(|(_, entry)| entry);
        match root_entry {
            Some(entry) if entry.kind == crate::dirent::EntryKind::Directory => {}
            _ => {
                if let Err(e) = self.fetcher.quota().unpin(&digest) {
                    warn!(err=%e, "unable to unpin rejected catalog");
                }
                return Err(ManagerError::Inconsistent(
                    "root catalog has no root directory entry".into(),
                ));
            }
        }

        let row_count = catalog.row_count();
        let span = 2 * (row_count + 1);
        let base = self.next_inode_base.fetch_add(span, Ordering::SeqCst);
        self.attaches.fetch_add(1, Ordering::Relaxed);

        Ok(Slot {
            mountpoint: ROOT_PATH.to_string(),
            digest,
            parent: None,
            children: vec![],
            state: SlotState::Active,
            catalog: Some(Arc::new(catalog)),
            inode_base: base,
            inode_span: span,
            row_count,
            last_access_ms: AtomicU64::new(self.epoch.elapsed().as_millis() as u64),
        })
    }

    /// Fetches a catalog object into the local store, pins it and opens
    /// it.
    async fn load_catalog(&self, digest: &ObjectDigest) -> Result<Catalog, ManagerError> {
        let path = self.fetcher.fetch(digest, ObjectKind::Catalog).await?;
        if let Err(e) = self.fetcher.quota().pin(digest) {
            warn!(err=%e, "unable to pin catalog");
        }
        match Catalog::open(&path, self.context.clone()) {
            Ok(catalog) => Ok(catalog),
            Err(e) => {
                if let Err(e) = self.fetcher.quota().unpin(digest) {
                    warn!(err=%e, "unable to unpin unreadable catalog");
                }
                Err(e.into())
            }
        }
    }
}
