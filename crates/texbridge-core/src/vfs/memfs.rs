//! In-memory directory tree with a stream table.

use std::collections::BTreeMap;

use super::{TEX_CACHE_ROOT, VfsError, WORK_ROOT};

/// Stream descriptor. 0, 1 and 2 are reserved for the standard streams and
/// are never handed out.
pub type Fd = u32;

/// First descriptor available to opened files.
const FIRST_FD: Fd = 3;

type DirEntries = BTreeMap<String, Node>;

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir(DirEntries),
}

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Result of [`MemFs::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Byte length for files, number of entries for directories.
    pub size: usize,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Open mode for [`MemFs::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const WRITE: i32 = 1;
    pub const CREATE: i32 = 1 << 1;
    pub const TRUNCATE: i32 = 1 << 2;
    pub const APPEND: i32 = 1 << 3;

    /// Read-only access to an existing file.
    pub fn read() -> Self {
        Self::default()
    }

    /// Create or truncate a file for writing.
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            append: false,
        }
    }

    /// Decode the bit set used by the module ABI.
    pub fn from_bits(bits: i32) -> Self {
        Self {
            write: bits & Self::WRITE != 0,
            create: bits & Self::CREATE != 0,
            truncate: bits & Self::TRUNCATE != 0,
            append: bits & Self::APPEND != 0,
        }
    }
}

#[derive(Debug)]
struct Stream {
    path: Vec<String>,
    pos: usize,
    writable: bool,
    append: bool,
}

/// The module's virtual filesystem.
///
/// Paths are `/`-separated; relative paths resolve against the current
/// directory. `..` never climbs above `/`.
#[derive(Debug)]
pub struct MemFs {
    root: DirEntries,
    cwd: Vec<String>,
    streams: BTreeMap<Fd, Stream>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Create a filesystem with the resource cache root and work root in place.
    pub fn new() -> Self {
        let mut fs = Self {
            root: DirEntries::new(),
            cwd: Vec::new(),
            streams: BTreeMap::new(),
        };
        for root in [TEX_CACHE_ROOT, WORK_ROOT] {
            let name = root.trim_start_matches('/').to_string();
            fs.root.insert(name, Node::Dir(DirEntries::new()));
        }
        fs
    }

    /// Split `path` into normalized components.
    fn components(&self, path: &str) -> Result<Vec<String>, VfsError> {
        if path.is_empty() || path.contains('\0') {
            return Err(VfsError::InvalidPath(path.to_string()));
        }

        let mut parts = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.clone()
        };

        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name.to_string()),
            }
        }

        Ok(parts)
    }

    fn display(parts: &[String]) -> String {
        format!("/{}", parts.join("/"))
    }

    fn node(&self, parts: &[String]) -> Option<&Node> {
        let mut entries = &self.root;
        let (last, parents) = match parts.split_last() {
            Some(split) => split,
            None => return None,
        };
        for name in parents {
            match entries.get(name) {
                Some(Node::Dir(children)) => entries = children,
                _ => return None,
            }
        }
        entries.get(last)
    }

    fn dir(&self, parts: &[String]) -> Result<&DirEntries, VfsError> {
        if parts.is_empty() {
            return Ok(&self.root);
        }
        match self.node(parts) {
            Some(Node::Dir(children)) => Ok(children),
            Some(Node::File(_)) => Err(VfsError::NotADirectory(Self::display(parts))),
            None => Err(VfsError::NotFound(Self::display(parts))),
        }
    }

    fn dir_mut(&mut self, parts: &[String]) -> Result<&mut DirEntries, VfsError> {
        let mut entries = &mut self.root;
        for (depth, name) in parts.iter().enumerate() {
            match entries.get_mut(name) {
                Some(Node::Dir(children)) => entries = children,
                Some(Node::File(_)) => {
                    return Err(VfsError::NotADirectory(Self::display(&parts[..=depth])));
                }
                None => return Err(VfsError::NotFound(Self::display(&parts[..=depth]))),
            }
        }
        Ok(entries)
    }

    /// Resolve the parent directory of `path` and the final component name.
    fn parent_mut(&mut self, path: &str) -> Result<(&mut DirEntries, String), VfsError> {
        let mut parts = self.components(path)?;
        let name = parts
            .pop()
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let parent = self.dir_mut(&parts)?;
        Ok((parent, name))
    }

    fn file_mut(&mut self, parts: &[String]) -> Result<&mut Vec<u8>, VfsError> {
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| VfsError::IsADirectory("/".to_string()))?;
        let parent = self.dir_mut(parents)?;
        match parent.get_mut(last) {
            Some(Node::File(data)) => Ok(data),
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory(Self::display(parts))),
            None => Err(VfsError::NotFound(Self::display(parts))),
        }
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<(), VfsError> {
        let (parent, name) = self.parent_mut(path)?;
        if parent.contains_key(&name) {
            return Err(VfsError::AlreadyExists(path.to_string()));
        }
        parent.insert(name, Node::Dir(DirEntries::new()));
        Ok(())
    }

    /// Create a directory and any missing parents.
    pub fn mkdir_all(&mut self, path: &str) -> Result<(), VfsError> {
        let parts = self.components(path)?;
        let mut entries = &mut self.root;
        for (depth, name) in parts.iter().enumerate() {
            let node = entries
                .entry(name.clone())
                .or_insert_with(|| Node::Dir(DirEntries::new()));
            match node {
                Node::Dir(children) => entries = children,
                Node::File(_) => {
                    return Err(VfsError::NotADirectory(Self::display(&parts[..=depth])));
                }
            }
        }
        Ok(())
    }

    /// Create or replace a file. The parent directory must exist.
    pub fn write_file(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), VfsError> {
        let (parent, name) = self.parent_mut(path)?;
        if let Some(Node::Dir(_)) = parent.get(&name) {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        parent.insert(name, Node::File(data.into()));
        Ok(())
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let parts = self.components(path)?;
        match self.node(&parts) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory(path.to_string())),
            None if parts.is_empty() => Err(VfsError::IsADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, VfsError> {
        let parts = self.components(path)?;
        if parts.is_empty() {
            return Ok(FileStat {
                kind: FileKind::Directory,
                size: self.root.len(),
            });
        }
        match self.node(&parts) {
            Some(Node::File(data)) => Ok(FileStat {
                kind: FileKind::File,
                size: data.len(),
            }),
            Some(Node::Dir(children)) => Ok(FileStat {
                kind: FileKind::Directory,
                size: children.len(),
            }),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    /// Remove a file. Directories are rejected; use [`rmdir`](Self::rmdir).
    pub fn unlink(&mut self, path: &str) -> Result<(), VfsError> {
        let (parent, name) = self.parent_mut(path)?;
        match parent.get(&name) {
            Some(Node::File(_)) => {
                parent.remove(&name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(VfsError::IsADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), VfsError> {
        let (parent, name) = self.parent_mut(path)?;
        match parent.get(&name) {
            Some(Node::Dir(children)) if children.is_empty() => {
                parent.remove(&name);
                Ok(())
            }
            Some(Node::Dir(_)) => Err(VfsError::NotEmpty(path.to_string())),
            Some(Node::File(_)) => Err(VfsError::NotADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    /// List entry names in a directory, sorted.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, VfsError> {
        let parts = self.components(path)?;
        Ok(self.dir(&parts)?.keys().cloned().collect())
    }

    /// Change the current directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), VfsError> {
        let parts = self.components(path)?;
        self.dir(&parts)?;
        self.cwd = parts;
        Ok(())
    }

    /// Current directory as an absolute path.
    pub fn cwd(&self) -> String {
        Self::display(&self.cwd)
    }

    /// Open a stream on a file.
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd, VfsError> {
        let parts = self.components(path)?;

        if flags.write {
            let (last, parents) = parts
                .split_last()
                .ok_or_else(|| VfsError::IsADirectory(path.to_string()))?;
            let parent = self.dir_mut(parents)?;
            match parent.get_mut(last) {
                Some(Node::Dir(_)) => return Err(VfsError::IsADirectory(path.to_string())),
                Some(Node::File(data)) => {
                    if flags.truncate {
                        data.clear();
                    }
                }
                None if flags.create => {
                    parent.insert(last.clone(), Node::File(Vec::new()));
                }
                None => return Err(VfsError::NotFound(path.to_string())),
            }
        } else {
            match self.node(&parts) {
                Some(Node::File(_)) => {}
                Some(Node::Dir(_)) => return Err(VfsError::IsADirectory(path.to_string())),
                None => return Err(VfsError::NotFound(path.to_string())),
            }
        }

        let fd = self.next_fd();
        self.streams.insert(
            fd,
            Stream {
                path: parts,
                pos: 0,
                writable: flags.write,
                append: flags.append,
            },
        );
        Ok(fd)
    }

    fn next_fd(&self) -> Fd {
        let mut fd = FIRST_FD;
        while self.streams.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    /// Read from a stream into `buf`, returning the byte count (0 at end of file).
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, VfsError> {
        let stream = self.streams.get(&fd).ok_or(VfsError::BadDescriptor(fd))?;
        let (path, pos) = (stream.path.clone(), stream.pos);
        let data = match self.node(&path) {
            Some(Node::File(data)) => data,
            _ => return Err(VfsError::NotFound(Self::display(&path))),
        };

        let start = pos.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);

        if let Some(stream) = self.streams.get_mut(&fd) {
            stream.pos = start + n;
        }
        Ok(n)
    }

    /// Write to a stream opened for writing.
    pub fn write(&mut self, fd: Fd, bytes: &[u8]) -> Result<usize, VfsError> {
        let stream = self.streams.get(&fd).ok_or(VfsError::BadDescriptor(fd))?;
        if !stream.writable {
            return Err(VfsError::BadDescriptor(fd));
        }
        let (path, pos, append) = (stream.path.clone(), stream.pos, stream.append);

        let data = self.file_mut(&path)?;
        let start = if append { data.len() } else { pos };
        if data.len() < start + bytes.len() {
            data.resize(start + bytes.len(), 0);
        }
        data[start..start + bytes.len()].copy_from_slice(bytes);

        if let Some(stream) = self.streams.get_mut(&fd) {
            stream.pos = start + bytes.len();
        }
        Ok(bytes.len())
    }

    pub fn close(&mut self, fd: Fd) -> Result<(), VfsError> {
        self.streams
            .remove(&fd)
            .map(|_| ())
            .ok_or(VfsError::BadDescriptor(fd))
    }

    /// Descriptors of every stream currently open.
    pub fn open_streams(&self) -> Vec<Fd> {
        self.streams.keys().copied().collect()
    }

    /// Recursively delete everything below `dir`.
    ///
    /// `dir` itself is removed too, except for the work root. Entries that
    /// cannot be removed are logged and skipped.
    pub fn clean_dir(&mut self, dir: &str) {
        let entries = match self.readdir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Not able to list {}: {}", dir, e);
                return;
            }
        };

        for entry in entries {
            let item = format!("{}/{}", dir.trim_end_matches('/'), entry);
            match self.stat(&item) {
                Ok(stat) if stat.is_dir() => self.clean_dir(&item),
                Ok(_) => {
                    if let Err(e) = self.unlink(&item) {
                        tracing::warn!("Not able to unlink {}: {}", item, e);
                    }
                }
                Err(e) => tracing::warn!("Not able to stat {}: {}", item, e),
            }
        }

        if dir != WORK_ROOT
            && let Err(e) = self.rmdir(dir)
        {
            tracing::warn!("Not able to remove {}: {}", dir, e);
        }
    }
}
