//! Record store over the vault directory tree.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use vault_common::{Error, Result, ResultExt};
use walkdir::WalkDir;

use crate::record::{self, Header, Record};
use crate::state::{Layout, State};

/// Enumeration order for [`Vault::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    /// Most recently modified first
    Recent,
    /// By file name, for deterministic passes
    Lexical,
}

/// Handle on a vault root.
#[derive(Debug, Clone)]
pub struct Vault {
    layout: Layout,
    canonical_root: PathBuf,
}

impl Vault {
    /// Open a vault, creating the directory layout if it is missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()?.join(root)
        };
        let layout = Layout::new(root);
        layout
            .ensure()
            .context(format!("creating vault layout at {}", layout.root().display()))?;
        let canonical_root = layout.root().canonicalize()?;
        Ok(Self {
            layout,
            canonical_root,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Resolve `candidate` against the root and refuse anything that escapes it.
    ///
    /// Relative candidates are joined to the root; `..` is resolved lexically
    /// and may not climb above the root. For paths that already exist, the
    /// nearest existing ancestor is canonicalised so a symlink pointing out of
    /// the vault is rejected too.
    pub fn validate_path(&self, candidate: impl AsRef<Path>) -> Result<PathBuf> {
        let candidate = candidate.as_ref();
        let display = candidate.to_string_lossy().to_string();
        if display.contains('\0') {
            return Err(Error::PathTraversal(display));
        }

        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root().join(candidate)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => normalized.push(component.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(Error::PathTraversal(display));
                    }
                }
                Component::Normal(part) => normalized.push(part),
            }
        }

        if !normalized.starts_with(self.root()) {
            return Err(Error::PathTraversal(display));
        }

        let mut probe = Some(normalized.as_path());
        while let Some(p) = probe {
            if p.exists() {
                let canonical = p.canonicalize()?;
                if !canonical.starts_with(&self.canonical_root) {
                    return Err(Error::PathTraversal(display));
                }
                break;
            }
            probe = p.parent();
        }

        Ok(normalized)
    }

    /// Read a record.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Record> {
        let path = self.validate_path(path)?;
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let (header, body) = record::parse(&text, &path)?;
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(Record {
            id: record::record_id(&path),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path,
            header,
            body,
            modified,
        })
    }

    /// Create or replace a record. Producers use this.
    pub fn write(&self, path: impl AsRef<Path>, header: &Header, body: &str) -> Result<PathBuf> {
        let path = self.validate_path(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::InvalidInput(format!("no file name in {}", path.display())))?;
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, record::render(header, body))?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Replace a record that must still exist at `path`.
    ///
    /// Fails with `AlreadyClaimed` when the file is gone, so a worker that lost
    /// a race never recreates a record another worker has moved.
    pub fn rewrite(&self, path: impl AsRef<Path>, header: &Header, body: &str) -> Result<()> {
        let path = self.validate_path(path)?;
        let mut file = match OpenOptions::new().write(true).truncate(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::AlreadyClaimed(path)),
            Err(e) => return Err(e.into()),
        };
        file.write_all(record::render(header, body).as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Lazily enumerate `*.md` records below `dir`, recursively.
    ///
    /// Records that disappear between the scan and the read are skipped.
    /// Corrupt records are yielded as errors for the caller to log.
    pub fn list(&self, dir: impl AsRef<Path>, order: ListOrder) -> Result<Listing<'_>> {
        let dir = self.validate_path(dir)?;
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();

        if dir.is_dir() {
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() || !is_record_file(entry.path()) {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                entries.push((entry.into_path(), modified));
            }
        }

        match order {
            ListOrder::Recent => entries.sort_by(|a, b| {
                b.1.cmp(&a.1).then_with(|| file_name(&a.0).cmp(&file_name(&b.0)))
            }),
            ListOrder::Lexical => entries.sort_by(|a, b| {
                file_name(&a.0)
                    .cmp(&file_name(&b.0))
                    .then_with(|| a.0.cmp(&b.0))
            }),
        }

        Ok(Listing {
            vault: self,
            paths: entries.into_iter().map(|(p, _)| p).collect::<Vec<_>>().into_iter(),
        })
    }

    /// Records in a state, skipping (and logging) unreadable ones.
    pub fn records(&self, state: State, order: ListOrder) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        for item in self.list(self.layout.state_dir(state), order)? {
            match item {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!(state = %state, error = %e, "Skipping unreadable record"),
            }
        }
        Ok(out)
    }

    /// Locate a record by id in any of `states`.
    pub fn find(&self, id: &str, states: &[State]) -> Result<Record> {
        if id.is_empty() || id.contains(['/', '\\', '\0']) || id.contains("..") {
            return Err(Error::PathTraversal(id.to_string()));
        }
        for state in states {
            for item in self.list(self.layout.state_dir(*state), ListOrder::Lexical)? {
                if let Ok(record) = item {
                    if record.id == id {
                        return Ok(record);
                    }
                }
            }
        }
        Err(Error::NotFound(format!("record {id}")))
    }
}

/// Iterator returned by [`Vault::list`].
pub struct Listing<'a> {
    vault: &'a Vault,
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for Listing<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        for path in self.paths.by_ref() {
            match self.vault.read(&path) {
                Err(Error::NotFound(_)) => continue,
                other => return Some(other),
            }
        }
        None
    }
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.extension().and_then(|e| e.to_str()) == Some("md")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
