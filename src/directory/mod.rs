//! Monitored entity listing and cgroup-to-entity resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

use crate::config::{DirectoryConfig, StaticEntity};
use crate::tracer::event::EntityId;

/// One monitored entity as reported by a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub name: EntityId,
    pub namespace: Arc<str>,
    /// Kernel cgroup ids whose tasks belong to this entity.
    pub cgroup_ids: Vec<u64>,
}

/// Entity listing trait.
pub trait Directory: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// List the entities in `scope`. An empty scope lists every namespace.
    fn list(&self, scope: &str) -> Result<Vec<EntityInfo>>;
}

fn in_scope(scope: &str, namespace: &str) -> bool {
    scope.is_empty() || scope == namespace
}

/// Entities listed in configuration.
pub struct StaticDirectory {
    entities: Vec<EntityInfo>,
}

impl StaticDirectory {
    pub fn new(entities: &[StaticEntity]) -> Self {
        Self {
            entities: entities
                .iter()
                .map(|e| EntityInfo {
                    name: EntityId::from(e.name.as_str()),
                    namespace: Arc::from(e.namespace.as_str()),
                    cgroup_ids: if e.cgroup_id == 0 {
                        Vec::new()
                    } else {
                        vec![e.cgroup_id]
                    },
                })
                .collect(),
        }
    }
}

impl Directory for StaticDirectory {
    fn name(&self) -> &str {
        "static"
    }

    fn list(&self, scope: &str) -> Result<Vec<EntityInfo>> {
        Ok(self
            .entities
            .iter()
            .filter(|e| in_scope(scope, &e.namespace))
            .cloned()
            .collect())
    }
}

/// Maximum directory depth scanned below the cgroup root.
#[cfg(target_os = "linux")]
const MAX_CGROUP_DEPTH: usize = 8;

/// Pods found by scanning a cgroup v2 hierarchy.
///
/// Recognizes the systemd driver layout (`kubepods-<qos>-pod<uid>.slice`)
/// and the cgroupfs layout (`pod<uid>`). Every cgroup below a pod directory,
/// the pod directory included, maps to that pod. A cgroup's inode number is
/// the id the kernel reports for its tasks.
pub struct CgroupDirectory {
    root: std::path::PathBuf,
    namespace: Arc<str>,
}

impl CgroupDirectory {
    pub fn new(root: impl Into<std::path::PathBuf>, namespace: &str) -> Self {
        Self {
            root: root.into(),
            namespace: Arc::from(namespace),
        }
    }
}

impl Directory for CgroupDirectory {
    fn name(&self) -> &str {
        "cgroup"
    }

    #[cfg(target_os = "linux")]
    fn list(&self, scope: &str) -> Result<Vec<EntityInfo>> {
        if !in_scope(scope, &self.namespace) {
            return Ok(Vec::new());
        }

        let mut pods: HashMap<EntityId, Vec<u64>> = HashMap::with_capacity(64);
        scan_cgroups(&self.root, None, 0, &mut pods)
            .with_context(|| format!("scanning cgroups under {}", self.root.display()))?;

        let mut entities: Vec<EntityInfo> = pods
            .into_iter()
            .map(|(name, cgroup_ids)| EntityInfo {
                name,
                namespace: Arc::clone(&self.namespace),
                cgroup_ids,
            })
            .collect();
        entities.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(count = entities.len(), "discovered pods from cgroups");
        Ok(entities)
    }

    #[cfg(not(target_os = "linux"))]
    fn list(&self, _scope: &str) -> Result<Vec<EntityInfo>> {
        warn!("cgroup entity discovery is only supported on Linux");
        Ok(Vec::new())
    }
}

#[cfg(target_os = "linux")]
fn scan_cgroups(
    dir: &std::path::Path,
    owner: Option<&EntityId>,
    depth: usize,
    pods: &mut HashMap<EntityId, Vec<u64>>,
) -> Result<()> {
    use std::fs;

    if depth > MAX_CGROUP_DEPTH {
        return Ok(());
    }

    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if !file_type.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let path = entry.path();

        let pod = match owner {
            Some(owner) => Some(EntityId::clone(owner)),
            None => pod_uid(&name).map(|uid| EntityId::from(uid.as_str())),
        };

        if let Some(pod) = &pod {
            match cgroup_inode(&path) {
                Ok(ino) => pods.entry(EntityId::clone(pod)).or_default().push(ino),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "reading cgroup inode failed");
                    continue;
                }
            }
        }

        // Vanished subtrees are skipped, not fatal.
        if let Err(e) = scan_cgroups(&path, pod.as_ref(), depth + 1, pods) {
            debug!(error = %e, "skipping cgroup subtree");
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn cgroup_inode(path: &std::path::Path) -> std::io::Result<u64> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(path).map(|m| m.ino())
}

/// Extracts the pod uid from a cgroup directory name.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn pod_uid(name: &str) -> Option<String> {
    if let Some(stem) = name.strip_suffix(".slice") {
        let idx = stem.rfind("-pod")?;
        let uid = stem.get(idx + 4..)?;
        // systemd escapes '-' in unit names as '_'.
        return (!uid.is_empty()).then(|| uid.replace('_', "-"));
    }
    let uid = name.strip_prefix("pod")?;
    (!uid.is_empty() && uid.chars().all(|c| c.is_ascii_hexdigit() || c == '-'))
        .then(|| uid.to_string())
}

/// Union of several directories, deduplicated by entity name.
///
/// The first directory listing a name decides its namespace; cgroup ids from
/// later duplicates are merged in. A failing member fails the whole listing.
pub struct CompositeDirectory {
    members: Vec<Box<dyn Directory>>,
}

impl CompositeDirectory {
    pub fn new(members: Vec<Box<dyn Directory>>) -> Self {
        Self { members }
    }

    /// Static entries plus, when `cgroup_root` is set, a cgroup scan.
    pub fn from_config(cfg: &DirectoryConfig, default_namespace: &str) -> Self {
        let mut members: Vec<Box<dyn Directory>> = Vec::with_capacity(2);
        members.push(Box::new(StaticDirectory::new(&cfg.entities)));
        if !cfg.cgroup_root.is_empty() {
            members.push(Box::new(CgroupDirectory::new(
                &cfg.cgroup_root,
                default_namespace,
            )));
        }
        Self::new(members)
    }
}

impl Directory for CompositeDirectory {
    fn name(&self) -> &str {
        "composite"
    }

    fn list(&self, scope: &str) -> Result<Vec<EntityInfo>> {
        let mut result: Vec<EntityInfo> = Vec::with_capacity(64);
        let mut index: HashMap<EntityId, usize> = HashMap::with_capacity(64);

        for member in &self.members {
            let listed = member
                .list(scope)
                .with_context(|| format!("listing {} directory", member.name()))?;

            for entity in listed {
                match index.get(&entity.name) {
                    Some(&i) => {
                        if let Some(existing) = result.get_mut(i) {
                            for id in entity.cgroup_ids {
                                if !existing.cgroup_ids.contains(&id) {
                                    existing.cgroup_ids.push(id);
                                }
                            }
                        }
                    }
                    None => {
                        index.insert(EntityId::clone(&entity.name), result.len());
                        result.push(entity);
                    }
                }
            }
        }

        Ok(result)
    }
}

/// Cgroup id to entity lookup used when decoding events.
///
/// Rebuilt from each successful listing and swapped in whole, so lookups
/// from the collector never block.
pub struct EntityIndex {
    inner: ArcSwap<HashMap<u64, EntityId>>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Replaces the mapping with the cgroups of `entities`.
    ///
    /// A cgroup claimed by more than one entity keeps its first owner.
    pub fn refresh(&self, entities: &[EntityInfo]) {
        let mut map = HashMap::with_capacity(entities.len() * 2);
        let mut duplicates = HashSet::new();
        for entity in entities {
            for &id in &entity.cgroup_ids {
                if map.contains_key(&id) {
                    duplicates.insert(id);
                    continue;
                }
                map.insert(id, EntityId::clone(&entity.name));
            }
        }
        if !duplicates.is_empty() {
            warn!(count = duplicates.len(), "cgroups claimed by several entities");
        }
        self.inner.store(Arc::new(map));
    }

    pub fn resolve(&self, cgroup_id: u64) -> Option<EntityId> {
        self.inner.load().get(&cgroup_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}
