//! Content trees: the files an upload walks.
//!
//! A tree is made of [`ContentNode`]s, each either a file or a directory.

mod filesystem;

pub use filesystem::FilesystemContentTree;

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use url::Url;

/// Path of a node relative to the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ContentPath {
    segments: Vec<String>,
}

impl ContentPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Object key for this path, `/`-separated without a leading slash
    pub fn as_object_key(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

/// Opens fresh byte streams over a file's content
pub trait ContentStreams: Send + Sync {
    fn open(&self) -> Result<Box<dyn Read + Send>>;
}

#[derive(Clone)]
pub struct ContentFile {
    pub path: ContentPath,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub locator: Url,
    pub streams: Arc<dyn ContentStreams>,
}

impl fmt::Debug for ContentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentFile")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .field("locator", &self.locator.as_str())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ContentDirectory {
    pub path: ContentPath,
    pub last_modified: DateTime<Utc>,
    pub children: Vec<ContentNode>,
}

#[derive(Debug, Clone)]
pub enum ContentNode {
    File(ContentFile),
    Directory(ContentDirectory),
}

impl ContentNode {
    pub fn path(&self) -> &ContentPath {
        match self {
            ContentNode::File(file) => &file.path,
            ContentNode::Directory(directory) => &directory.path,
        }
    }

    /// All files beneath this node, depth first
    pub fn collect_files(&self) -> Vec<ContentFile> {
        let mut files = Vec::new();
        collect_into(self, &mut files);
        files
    }
}

fn collect_into(node: &ContentNode, files: &mut Vec<ContentFile>) {
    match node {
        ContentNode::File(file) => files.push(file.clone()),
        ContentNode::Directory(directory) => {
            for child in &directory.children {
                collect_into(child, files);
            }
        }
    }
}

/// Produces a content tree for a source locator
pub trait ContentTreeFactory: Send + Sync {
    fn create(&self, locator: &Url) -> Result<ContentNode>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Bytes(&'static [u8]);

    impl ContentStreams for Bytes {
        fn open(&self) -> Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.0)))
        }
    }

    fn file(path: ContentPath, data: &'static [u8]) -> ContentNode {
        ContentNode::File(ContentFile {
            path,
            size: data.len() as u64,
            last_modified: Utc::now(),
            locator: Url::parse("memory:///x").unwrap(),
            streams: Arc::new(Bytes(data)),
        })
    }

    #[test]
    fn test_object_key() {
        let path = ContentPath::root().child("DCIM").child("IMG_0001.jpg");
        assert_eq!(path.as_object_key(), "DCIM/IMG_0001.jpg");
        assert_eq!(path.to_string(), "/DCIM/IMG_0001.jpg");
        assert_eq!(ContentPath::root().as_object_key(), "");
    }

    #[test]
    fn test_collect_files_recurses() {
        let root = ContentPath::root();
        let sub = root.child("sub");
        let tree = ContentNode::Directory(ContentDirectory {
            path: root.clone(),
            last_modified: Utc::now(),
            children: vec![
                file(root.child("a"), b"a"),
                ContentNode::Directory(ContentDirectory {
                    path: sub.clone(),
                    last_modified: Utc::now(),
                    children: vec![file(sub.child("b"), b"bb"), file(sub.child("c"), b"ccc")],
                }),
            ],
        });

        let keys: Vec<String> = tree
            .collect_files()
            .iter()
            .map(|f| f.path.as_object_key())
            .collect();
        assert_eq!(keys, vec!["a", "sub/b", "sub/c"]);
    }
}
