//! `file://` content trees backed by the local filesystem.

use super::{ContentDirectory, ContentFile, ContentNode, ContentPath, ContentStreams, ContentTreeFactory};
use crate::error::{CourierError, Result};
use crate::logging::log_debug;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemContentTree;

impl FilesystemContentTree {
    pub fn new() -> Self {
        Self
    }
}

impl ContentTreeFactory for FilesystemContentTree {
    fn create(&self, locator: &Url) -> Result<ContentNode> {
        if locator.scheme() != "file" {
            return Err(CourierError::Content(format!(
                "Unsupported source scheme '{}' in {}",
                locator.scheme(),
                locator
            )));
        }

        let root = locator
            .to_file_path()
            .map_err(|_| CourierError::Content(format!("Not a local path: {}", locator)))?;

        if !root.exists() {
            return Err(CourierError::Content(format!(
                "Source does not exist: {}",
                root.display()
            )));
        }

        log_debug("content-tree", &format!("Reading content tree at {}", root.display()))
            .unwrap_or_default();

        if root.is_dir() {
            read_directory(&root, ContentPath::root())
        } else {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            read_file(&root, ContentPath::root().child(name))
        }
    }
}

/// A directory whose children are still being collected
struct PendingDirectory {
    path: ContentPath,
    dir: PathBuf,
    children: Vec<ContentNode>,
}

impl PendingDirectory {
    fn new(path: ContentPath, dir: &Path) -> Self {
        Self {
            path,
            dir: dir.to_path_buf(),
            children: Vec::new(),
        }
    }

    fn into_node(self) -> Result<ContentNode> {
        Ok(ContentNode::Directory(ContentDirectory {
            path: self.path,
            last_modified: modified_time(&self.dir)?,
            children: self.children,
        }))
    }
}

/// Pop the innermost open directory and attach it to its parent
fn close_directory(stack: &mut Vec<PendingDirectory>) -> Result<()> {
    if let Some(finished) = stack.pop() {
        let node = finished.into_node()?;
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => {
                return Err(CourierError::Invariant(
                    "content tree lost its root directory".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Build the whole tree from one depth-first walk.
///
/// `stack[i]` is the open directory at depth `i`, so an entry at depth `d`
/// belongs to `stack[d - 1]`.
fn read_directory(root: &Path, path: ContentPath) -> Result<ContentNode> {
    let mut stack = vec![PendingDirectory::new(path, root)];

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            CourierError::Content(format!("Failed to read {}: {}", root.display(), e))
        })?;

        while stack.len() > entry.depth() {
            close_directory(&mut stack)?;
        }
        let parent = stack.last_mut().ok_or_else(|| {
            CourierError::Invariant(format!("no parent for {}", entry.path().display()))
        })?;

        let name = entry.file_name().to_string_lossy().into_owned();
        let child_path = parent.path.child(name);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            stack.push(PendingDirectory::new(child_path, entry.path()));
        } else if file_type.is_file() {
            parent.children.push(read_file(entry.path(), child_path)?);
        }
    }

    while stack.len() > 1 {
        close_directory(&mut stack)?;
    }
    match stack.pop() {
        Some(root) => root.into_node(),
        None => Err(CourierError::Invariant(
            "content tree lost its root directory".to_string(),
        )),
    }
}

fn read_file(file: &Path, path: ContentPath) -> Result<ContentNode> {
    let metadata = fs::metadata(file)?;
    let locator = Url::from_file_path(file)
        .map_err(|_| CourierError::Content(format!("Not an absolute path: {}", file.display())))?;

    Ok(ContentNode::File(ContentFile {
        path,
        size: metadata.len(),
        last_modified: modified_time(file)?,
        locator,
        streams: Arc::new(FileStreams {
            path: file.to_path_buf(),
        }),
    }))
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

struct FileStreams {
    path: PathBuf,
}

impl ContentStreams for FileStreams {
    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}
