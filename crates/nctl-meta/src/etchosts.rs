//! Per-container `/etc/hosts` files.
//!
//! `etchosts/<namespace>/<id>/meta.json` records a container's addresses;
//! `etchosts/<namespace>/<id>/hosts` is the file bind-mounted into it.
//! Whenever a container joins or leaves, every hosts file of the namespace
//! is regenerated so peers on a shared network resolve each other.
//!
//! Only the block between the `# <nctl>` and `# </nctl>` marker lines is
//! managed; anything a user adds outside it is kept. Existing hosts files
//! are rewritten in place because a running container has the inode
//! mounted, and a rename would leave it reading the old file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;

use nctl_store::atomic;
use nctl_store::{Bucket, BucketKind, BucketLock, DataStore};
use nctl_types::{ContainerId, Namespace};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};

const HOSTS_FILE: &str = "hosts";
const META_FILE: &str = "meta.json";
const HOSTS_MODE: u32 = 0o644;

pub const BEGIN_MARKER: &str = "# <nctl>";
pub const END_MARKER: &str = "# </nctl>";

/// Addresses of one container, as recorded in `meta.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsMeta {
    pub id: ContainerId,
    pub name: String,
    pub hostname: String,
    /// Network name to the container's addresses on it.
    #[serde(default)]
    pub networks: BTreeMap<String, Vec<IpAddr>>,
    /// Additional `host -> address` entries (`--add-host`).
    #[serde(default)]
    pub extra_hosts: BTreeMap<String, IpAddr>,
}

impl HostsMeta {
    fn aliases(&self) -> String {
        if self.hostname.is_empty() || self.hostname == self.name {
            self.name.clone()
        } else {
            format!("{} {}", self.hostname, self.name)
        }
    }

    fn shares_network_with(&self, other: &HostsMeta) -> bool {
        self.networks.keys().any(|net| other.networks.contains_key(net))
    }
}

/// Hosts files of one namespace.
#[derive(Debug)]
pub struct HostsStore {
    namespace: Namespace,
    bucket: Bucket,
}

impl HostsStore {
    pub fn new(store: &DataStore, namespace: &Namespace) -> Self {
        Self {
            namespace: namespace.clone(),
            bucket: store.bucket(BucketKind::EtcHosts, namespace),
        }
    }

    pub fn lock(&self) -> MetaResult<BucketLock<'_>> {
        Ok(self.bucket.lock()?)
    }

    /// Record a container's addresses and regenerate the namespace's hosts
    /// files. Returns the path of the container's own hosts file.
    pub fn acquire(&self, meta: &HostsMeta) -> MetaResult<PathBuf> {
        let guard = self.lock()?;
        self.acquire_locked(&guard, meta)
    }

    /// [`Self::acquire`] for callers already holding [`Self::lock`].
    pub fn acquire_locked(&self, guard: &BucketLock<'_>, meta: &HostsMeta) -> MetaResult<PathBuf> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        self.bucket.set_json(&meta_key(&meta.id), meta)?;
        self.refresh_locked(guard)?;
        debug!(namespace = %self.namespace, id = meta.id.short(), "hosts entry registered");
        self.hosts_path(&meta.id)
    }

    /// Forget a container and regenerate the remaining hosts files.
    pub fn release(&self, id: &ContainerId) -> MetaResult<()> {
        let guard = self.lock()?;
        self.release_locked(&guard, id)
    }

    /// [`Self::release`] for callers already holding [`Self::lock`].
    pub fn release_locked(&self, guard: &BucketLock<'_>, id: &ContainerId) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        if !self.bucket.exists(id.as_str())? {
            return Ok(());
        }
        self.bucket.remove_group(id.as_str())?;
        self.refresh_locked(guard)?;
        debug!(namespace = %self.namespace, id = id.short(), "hosts entry released");
        Ok(())
    }

    /// Regenerate every hosts file of the namespace.
    pub fn refresh(&self) -> MetaResult<()> {
        let guard = self.lock()?;
        self.refresh_locked(&guard)
    }

    fn refresh_locked(&self, guard: &BucketLock<'_>) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        let all = self.all_meta()?;
        for own in &all {
            let path = self.hosts_path(&own.id)?;
            let block = render_block(own, &all);
            let existing = match atomic::read_file(&path) {
                Ok(raw) => Some(String::from_utf8_lossy(&raw).into_owned()),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            };
            match existing {
                Some(current) => {
                    let next = splice(&current, &block);
                    if next != current {
                        atomic::rewrite_in_place(&path, next.as_bytes(), HOSTS_MODE)?;
                        debug!(id = own.id.short(), "hosts file rewritten in place");
                    }
                }
                None => self.bucket.set(&hosts_key(&own.id), block.as_bytes())?,
            }
        }
        Ok(())
    }

    pub fn hosts_path(&self, id: &ContainerId) -> MetaResult<PathBuf> {
        Ok(self.bucket.location(&hosts_key(id))?)
    }

    /// Current content of a container's hosts file.
    pub fn hosts(&self, id: &ContainerId) -> MetaResult<String> {
        match self.bucket.get(&hosts_key(id)) {
            Ok(raw) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Err(e) if e.is_not_found() => Err(MetaError::ContainerNotFound { id: id.to_string() }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn meta(&self, id: &ContainerId) -> MetaResult<HostsMeta> {
        match self.bucket.get_json(&meta_key(id)) {
            Ok(meta) => Ok(meta),
            Err(e) if e.is_not_found() => Err(MetaError::ContainerNotFound { id: id.to_string() }),
            Err(e) => Err(e.into()),
        }
    }

    fn all_meta(&self) -> MetaResult<Vec<HostsMeta>> {
        let mut all = Vec::new();
        for entry in self.bucket.list("")? {
            let Ok(id) = ContainerId::new(entry.as_str()) else {
                warn!(namespace = %self.namespace, entry = %entry, "ignoring unexpected hosts entry");
                continue;
            };
            match self.meta(&id) {
                Ok(meta) => all.push(meta),
                Err(MetaError::ContainerNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(all)
    }
}

/// The managed block of `own`'s hosts file, markers included.
pub fn render_block(own: &HostsMeta, all: &[HostsMeta]) -> String {
    let mut entries: Vec<(String, String)> = vec![
        ("127.0.0.1".into(), "localhost localhost.localdomain".into()),
        ("::1".into(), "localhost localhost.localdomain".into()),
    ];
    for ip in own.networks.values().flatten() {
        entries.push((ip.to_string(), own.aliases()));
    }
    for peer in all {
        if peer.id == own.id || !own.shares_network_with(peer) {
            continue;
        }
        let shared = peer
            .networks
            .iter()
            .filter(|(net, _)| own.networks.contains_key(*net));
        for (_, ips) in shared {
            for ip in ips {
                entries.push((ip.to_string(), peer.aliases()));
            }
        }
    }
    for (host, ip) in &own.extra_hosts {
        entries.push((ip.to_string(), host.clone()));
    }

    let mut seen = BTreeSet::new();
    let mut out = format!("{BEGIN_MARKER}\n");
    for (ip, names) in entries {
        if seen.insert((ip.clone(), names.clone())) {
            let _ = writeln!(out, "{ip}\t{names}");
        }
    }
    out.push_str(END_MARKER);
    out.push('\n');
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Before,
    Managed,
    After,
}

/// Replace the managed block in `existing`, keeping every other line.
/// Without a block, the new one goes first.
pub fn splice(existing: &str, block: &str) -> String {
    let mut before = String::new();
    let mut after = String::new();
    let mut section = Section::Before;
    for line in existing.lines() {
        match section {
            Section::Before if line.trim_end() == BEGIN_MARKER => section = Section::Managed,
            Section::Before => {
                before.push_str(line);
                before.push('\n');
            }
            Section::Managed if line.trim_end() == END_MARKER => section = Section::After,
            Section::Managed => {}
            Section::After => {
                after.push_str(line);
                after.push('\n');
            }
        }
    }
    if section == Section::Before {
        return format!("{block}{before}");
    }
    format!("{before}{block}{after}")
}

fn hosts_key(id: &ContainerId) -> String {
    format!("{id}/{HOSTS_FILE}")
}

fn meta_key(id: &ContainerId) -> String {
    format!("{id}/{META_FILE}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    fn setup() -> (tempfile::TempDir, HostsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::at(dir.path());
        let hosts = HostsStore::new(&store, &Namespace::default());
        (dir, hosts)
    }

    fn host(fill: char, name: &str, nets: &[(&str, &str)]) -> HostsMeta {
        let mut networks: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
        for (net, ip) in nets {
            networks
                .entry(net.to_string())
                .or_default()
                .push(ip.parse().unwrap());
        }
        HostsMeta {
            id: ContainerId::new(fill.to_string().repeat(64)).unwrap(),
            name: name.to_string(),
            hostname: format!("{fill}{fill}"),
            networks,
            extra_hosts: BTreeMap::new(),
        }
    }

    #[test]
    fn block_lists_self_and_peers_on_shared_networks() {
        let web = host('a', "web", &[("front", "10.0.0.2")]);
        let api = host('b', "api", &[("front", "10.0.0.3"), ("back", "10.1.0.3")]);
        let db = host('c', "db", &[("back", "10.1.0.4")]);
        let all = vec![web.clone(), api.clone(), db.clone()];

        let block = render_block(&web, &all);
        assert!(block.starts_with("# <nctl>\n127.0.0.1\tlocalhost localhost.localdomain\n"));
        assert!(block.contains("::1\tlocalhost localhost.localdomain\n"));
        assert!(block.contains("10.0.0.2\taa web\n"));
        assert!(block.contains("10.0.0.3\tbb api\n"));
        // api's address on a network web is not on stays hidden.
        assert!(!block.contains("10.1.0.3"));
        assert!(!block.contains("db"));
        assert!(block.ends_with("# </nctl>\n"));

        let block = render_block(&api, &all);
        assert!(block.contains("10.0.0.2\taa web\n"));
        assert!(block.contains("10.1.0.4\tcc db\n"));
    }

    #[test]
    fn block_includes_extra_hosts() {
        let mut web = host('a', "web", &[]);
        web.extra_hosts
            .insert("registry.local".into(), "192.168.1.10".parse().unwrap());
        let block = render_block(&web, std::slice::from_ref(&web));
        assert!(block.contains("192.168.1.10\tregistry.local\n"));
    }

    #[test]
    fn splice_keeps_user_lines() {
        let block = "# <nctl>\n1.1.1.1\tnew\n# </nctl>\n";
        let existing = "# mine\n# <nctl>\n9.9.9.9\told\n# </nctl>\n5.5.5.5 custom\n";
        assert_eq!(
            splice(existing, block),
            "# mine\n# <nctl>\n1.1.1.1\tnew\n# </nctl>\n5.5.5.5 custom\n"
        );
        assert_eq!(splice("5.5.5.5 custom\n", block), format!("{block}5.5.5.5 custom\n"));
        assert_eq!(splice("", block), block);
    }

    #[test]
    fn acquire_writes_hosts_for_everyone() {
        let (_dir, hosts) = setup();
        let web = host('a', "web", &[("front", "10.0.0.2")]);
        let api = host('b', "api", &[("front", "10.0.0.3")]);

        let web_path = hosts.acquire(&web).unwrap();
        assert_eq!(web_path, hosts.hosts_path(&web.id).unwrap());
        hosts.acquire(&api).unwrap();

        let content = hosts.hosts(&web.id).unwrap();
        assert!(content.contains("10.0.0.3\tbb api"));
        let mode = fs::metadata(&web_path).unwrap().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(hosts.meta(&api.id).unwrap(), api);
    }

    #[test]
    fn existing_file_is_rewritten_in_place() {
        let (_dir, hosts) = setup();
        let web = host('a', "web", &[("front", "10.0.0.2")]);
        let path = hosts.acquire(&web).unwrap();
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("8.8.8.8 user-added\n");
        fs::write(&path, &content).unwrap();
        let inode = fs::metadata(&path).unwrap().ino();

        hosts.acquire(&host('b', "api", &[("front", "10.0.0.3")])).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().ino(), inode);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("10.0.0.3\tbb api"));
        assert!(content.ends_with("8.8.8.8 user-added\n"));
    }

    #[test]
    fn release_drops_peer_from_remaining_files() {
        let (_dir, hosts) = setup();
        let web = host('a', "web", &[("front", "10.0.0.2")]);
        let api = host('b', "api", &[("front", "10.0.0.3")]);
        hosts.acquire(&web).unwrap();
        hosts.acquire(&api).unwrap();

        hosts.release(&api.id).unwrap();
        hosts.release(&api.id).unwrap();

        assert!(!hosts.hosts(&web.id).unwrap().contains("api"));
        assert!(matches!(
            hosts.hosts(&api.id).unwrap_err(),
            MetaError::ContainerNotFound { .. }
        ));
    }
}
