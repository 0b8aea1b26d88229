//! Keeps programs outside the allow-list unreachable by absolute path.
//!
//! Every entry of the image's search path that does not resolve to an
//! allowed binary is covered with `/dev/null`.

use std::collections::HashSet;
use std::ffi::{CStr, CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};

use crate::launcher::{IMAGE_SEARCH_PATH, image_path};

/// Symlink hops followed when resolving inside a prebuilt image.
const MAX_LINK_DEPTH: usize = 16;

/// How masks are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MaskTarget {
    /// The path as listed in each search directory. bubblewrap binds
    /// `/bin` and `/usr/bin` separately, so both need their own mask.
    Listed,
    /// The file the entry resolves to. A host mount namespace shares the
    /// host's directory layout, where `/bin` may be `/usr/bin`.
    Resolved,
}

/// Search-path entries (as the sandbox sees them) to cover, sorted.
///
/// `keep` are the allowed binary names; an entry resolving to the same
/// file as one of them stays reachable.
pub(crate) fn masked_executables<'a>(
    image_root: Option<&Path>,
    keep: impl IntoIterator<Item = &'a str>,
    target: MaskTarget,
) -> Vec<PathBuf> {
    let kept: HashSet<PathBuf> = keep
        .into_iter()
        .flat_map(|name| {
            IMAGE_SEARCH_PATH
                .iter()
                .filter_map(move |dir| resolve(image_root, &Path::new(dir).join(name)))
        })
        .collect();

    let search: Vec<(&str, PathBuf)> = IMAGE_SEARCH_PATH
        .iter()
        .filter_map(|dir| Some((*dir, resolve(image_root, Path::new(dir))?)))
        .collect();
    // Links leading out of the search path (the dynamic loader, say) are
    // left alone: a mask would land on the file they point to.
    let in_search_path =
        |file: &Path| file.parent().is_some_and(|p| search.iter().any(|(_, real)| real == p));

    let mut masked = HashSet::new();
    for (dir, real_dir) in &search {
        let Ok(entries) = std::fs::read_dir(image_path(image_root, real_dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let listed = Path::new(dir).join(entry.file_name());
            let Some(resolved) = resolve(image_root, &listed) else {
                continue;
            };
            if kept.contains(&resolved)
                || !in_search_path(&resolved)
                || image_path(image_root, &resolved).is_dir()
            {
                continue;
            }
            masked.insert(match target {
                MaskTarget::Listed => listed,
                MaskTarget::Resolved => resolved,
            });
        }
    }
    let mut masked: Vec<PathBuf> = masked.into_iter().collect();
    masked.sort();
    masked
}

/// The file `path` (inside the image) names after following symlinks in
/// every component, without leaving the image.
fn resolve(image_root: Option<&Path>, path: &Path) -> Option<PathBuf> {
    let Some(root) = image_root else {
        return std::fs::canonicalize(path).ok();
    };
    let mut pending = Vec::new();
    push_components(&mut pending, path);
    let mut out = PathBuf::from("/");
    let mut hops = 0;
    while let Some(part) = pending.pop() {
        if part == ".." {
            out.pop();
            continue;
        }
        out.push(&part);
        let host = image_path(Some(root), &out);
        if !std::fs::symlink_metadata(&host).ok()?.file_type().is_symlink() {
            continue;
        }
        hops += 1;
        if hops > MAX_LINK_DEPTH {
            return None;
        }
        let link = std::fs::read_link(&host).ok()?;
        out.pop();
        if link.is_absolute() {
            out = PathBuf::from("/");
        }
        push_components(&mut pending, &link);
    }
    Some(out)
}

/// Queue `path`'s components so the first one is popped first.
fn push_components(pending: &mut Vec<OsString>, path: &Path) {
    let start = pending.len();
    for component in path.components() {
        match component {
            Component::Normal(part) => pending.push(part.to_os_string()),
            Component::ParentDir => pending.push("..".into()),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if let Some(added) = pending.get_mut(start..) {
        added.reverse();
    }
}

/// Masks applied by the host launcher in the child's own mount namespace.
///
/// Paths are converted to C strings up front; `apply` runs between `fork`
/// and `exec` and must not allocate.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostMasks {
    targets: Vec<CString>,
}

impl HostMasks {
    pub(crate) fn new(paths: &[PathBuf]) -> io::Result<Self> {
        let targets = paths
            .iter()
            .map(|p| {
                CString::new(p.as_os_str().as_bytes())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
            })
            .collect::<io::Result<_>>()?;
        Ok(Self { targets })
    }

    pub(crate) fn len(&self) -> usize {
        self.targets.len()
    }

    /// Detach from the host's mount namespace and bind `/dev/null` over
    /// every target. Needs CAP_SYS_ADMIN, so it runs before the identity
    /// switch.
    pub(crate) fn apply(&self) -> io::Result<()> {
        unshare(CloneFlags::CLONE_NEWNS)?;
        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;
        for target in &self.targets {
            match mount(
                Some(c"/dev/null"),
                target.as_c_str(),
                None::<&CStr>,
                MsFlags::MS_BIND,
                None::<&CStr>,
            ) {
                // Removed from the host since the list was built.
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
