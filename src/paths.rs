//! Path canonicalisation and containment checks.
//!
//! Every sandboxing decision in the crate (which files a page may include,
//! which files a running page may open) goes through [`is_within`].

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Return an absolute, symlink-free form of `path`.
///
/// Relative paths are taken relative to `base`. Every existing ancestor is
/// resolved through the filesystem; once a component does not exist, the rest
/// of the path is appended lexically (a directory that does not exist cannot
/// be a symlink, so `..` below that point simply pops a component).
pub fn canonical_path(path: &Path, base: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    // `missing` counts the lexical components pushed past the first one that
    // does not exist; while it is zero, `resolved` is a real path.
    let mut resolved = PathBuf::new();
    let mut missing = 0usize;
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                missing = missing.saturating_sub(1);
            }
            Component::Normal(name) => {
                resolved.push(name);
                if missing > 0 {
                    missing += 1;
                    continue;
                }
                match fs::canonicalize(&resolved) {
                    Ok(real) => resolved = real,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => missing = 1,
                    Err(e) => return Err(e),
                }
            }
        }
    }
    if resolved.as_os_str().is_empty() {
        resolved = fs::canonicalize(".")?;
    }
    Ok(resolved)
}

/// Report whether `child` lies in or below `parent` (or is `parent`).
///
/// Both paths are canonicalised first, relative ones against `base`.
/// Comparison is per path component, so `/srv/www2` is not inside `/srv/www`.
pub fn is_within(child: &Path, parent: &Path, base: &Path) -> io::Result<bool> {
    let parent = canonical_path(parent, base)?;
    let child = canonical_path(child, base)?;
    Ok(child.starts_with(&parent))
}

/// Open `name` for reading, refusing anything outside `base`.
pub fn open_within(base: &Path, name: &Path) -> io::Result<File> {
    let real = canonical_path(name, base)?;
    if !real.starts_with(canonical_path(base, base)?) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("{} lies outside {}", name.display(), base.display()),
        ));
    }
    File::open(real)
}
