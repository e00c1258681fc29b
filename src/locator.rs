//! Discovery of captured traffic files.
//!
//! Traffic is stored under `<root>/yyyy/mm/dd/hh/<file>`. The locator walks
//! that tree depth-first, newest entries first, skips hours after the replay cutoff,
//! keeps only the files that belong to this job's shard, and hands each one
//! over as a local plain-text copy.

use flate2::read::MultiGzDecoder;
use regex::Regex;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::storage::{final_component, ObjectStore, StorageError};

const GZIP_MAGIC: [u8; 2] = [31, 139];

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("'{0}' does not fit the yyyy/mm/dd/hh/file layout")]
    Unclassified(String),

    #[error("invalid traffic root: {0}")]
    Pattern(#[from] regex::Error),
}

/// Position of a path in the traffic tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Base,
    Year,
    Month,
    Day,
    Hour,
    File,
}

impl NodeType {
    /// The type of this node's children.
    pub fn successor(&self) -> Option<NodeType> {
        match self {
            NodeType::Base => Some(NodeType::Year),
            NodeType::Year => Some(NodeType::Month),
            NodeType::Month => Some(NodeType::Day),
            NodeType::Day => Some(NodeType::Hour),
            NodeType::Hour => Some(NodeType::File),
            NodeType::File => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeType::Base => "base",
            NodeType::Year => "year",
            NodeType::Month => "month",
            NodeType::Day => "day",
            NodeType::Hour => "hour",
            NodeType::File => "file",
        }
    }
}

/// Anchored patterns for each level below a root.
#[derive(Debug)]
struct NodePatterns {
    levels: Vec<(NodeType, Regex)>,
}

impl NodePatterns {
    fn new(root: &str) -> Result<Self, regex::Error> {
        let root = regex::escape(root);
        let level = |node: NodeType, suffix: &str| -> Result<(NodeType, Regex), regex::Error> {
            Ok((node, Regex::new(&format!("^{}{}$", root, suffix))?))
        };
        Ok(Self {
            levels: vec![
                level(NodeType::Base, "")?,
                level(NodeType::Year, "[0-9]{4}/")?,
                level(NodeType::Month, "[0-9]{4}/[0-9]{2}/")?,
                level(NodeType::Day, "[0-9]{4}/[0-9]{2}/[0-9]{2}/")?,
                level(NodeType::Hour, "[0-9]{4}/[0-9]{2}/[0-9]{2}/[0-9]{2}/")?,
                level(NodeType::File, "[0-9]{4}/[0-9]{2}/[0-9]{2}/[0-9]{2}/.+")?,
            ],
        })
    }

    fn classify(&self, path: &str) -> Option<NodeType> {
        self.levels
            .iter()
            .find(|(_, re)| re.is_match(path))
            .map(|(node, _)| *node)
    }
}

/// Whether the file at `index` among `count` files of one hour belongs to
/// `job_number` of `total_jobs`. With more jobs than files, files are shared.
pub fn for_this_job(index: usize, count: usize, job_number: u64, total_jobs: u64) -> bool {
    if count == 0 || total_jobs == 0 || job_number == 0 {
        return false;
    }
    let count = count as u64;
    (index as u64) % total_jobs % count == (job_number - 1) % count
}

/// Whether a date key (`yyyy`, `yyyy/mm`, `yyyy/mm/dd` or `yyyy/mm/dd/hh`) lies
/// after the cutoff. `cutoff` uses the `yyyy/mm/dd/hh` form.
pub fn too_recent(date_key: &str, cutoff: &str) -> bool {
    match cutoff.get(..date_key.len()) {
        Some(prefix) => date_key > prefix,
        None => false,
    }
}

/// Walks the traffic tree for one job.
pub struct FileLocator {
    store: Arc<dyn ObjectStore>,
    root: String,
    patterns: NodePatterns,
    cutoff: String,
    job_number: u64,
    total_jobs: u64,
    work_dir: PathBuf,
}

impl FileLocator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        root: &str,
        start_before: &str,
        job_number: u64,
        total_jobs: u64,
        work_dir: PathBuf,
    ) -> Result<Self, LocatorError> {
        let root = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{}/", root)
        };
        Ok(Self {
            store,
            patterns: NodePatterns::new(&root)?,
            root,
            cutoff: start_before.replace(':', "/"),
            job_number,
            total_jobs,
            work_dir,
        })
    }

    pub fn from_config(
        config: &JobConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, LocatorError> {
        Self::new(
            store,
            &config.source,
            &config.start_before,
            config.job_number,
            config.total_jobs,
            config.work_dir.clone(),
        )
    }

    pub fn classify(&self, path: &str) -> Result<NodeType, LocatorError> {
        self.patterns
            .classify(path)
            .ok_or_else(|| LocatorError::Unclassified(path.to_string()))
    }

    /// Sends the local copy of every file of this shard on `files`, in
    /// traversal order. Returns quietly if the receiver goes away.
    pub async fn run(self, files: mpsc::Sender<PathBuf>) -> Result<(), LocatorError> {
        let mut stack = vec![self.root.clone()];
        let mut sent = 0u64;

        while let Some(path) = stack.pop() {
            let node = self.classify(&path)?;
            if node != NodeType::File {
                let children = self.expand(&path, node).await?;
                // Sorted children popped from the end: newest hours first.
                stack.extend(children);
                continue;
            }

            let local = match self.acquire(&path).await {
                Ok(local) => local,
                Err(e) => {
                    warn!(file = %path, error = %e, "Failed to fetch traffic file, skipping");
                    continue;
                }
            };
            debug!(file = %path, local = %local.display(), "Traffic file ready");
            if let Err(mpsc::error::SendError(local)) = files.send(local).await {
                let _ = tokio::fs::remove_file(&local).await;
                debug!("File consumer gone, stopping discovery");
                return Ok(());
            }
            sent += 1;
        }

        info!(files = sent, root = %self.root, "Traffic discovery finished");
        Ok(())
    }

    /// Children of `path` worth visiting.
    async fn expand(&self, path: &str, node: NodeType) -> Result<Vec<String>, LocatorError> {
        let expected = node.successor();
        let mut children = Vec::new();
        for child in self.store.list(path).await? {
            if Some(self.classify(&child)?) == expected {
                children.push(child);
            }
        }

        if expected == Some(NodeType::File) {
            let count = children.len();
            return Ok(children
                .into_iter()
                .enumerate()
                .filter(|(i, _)| for_this_job(*i, count, self.job_number, self.total_jobs))
                .map(|(_, child)| child)
                .collect());
        }

        Ok(children
            .into_iter()
            .filter(|child| !too_recent(self.date_key(child), &self.cutoff))
            .collect())
    }

    /// The `yyyy[/mm[/dd[/hh]]]` part of a directory path.
    fn date_key<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.root.as_str())
            .unwrap_or(path)
            .trim_end_matches('/')
    }

    /// Local name for a traffic file: its date path and stem, so files with
    /// the same name from different hours don't collide.
    fn local_name(&self, path: &str) -> String {
        let stem = final_component(path)
            .split('.')
            .next()
            .unwrap_or_default();
        let relative = path.strip_prefix(self.root.as_str()).unwrap_or(path);
        let mut parts: Vec<&str> = relative.split('/').collect();
        parts.pop();
        parts.push(stem);
        format!("{}.txt", parts.join("_"))
    }

    async fn acquire(&self, path: &str) -> Result<PathBuf, StorageError> {
        let raw = self.store.open(path).await?;
        let data = if raw.starts_with(&GZIP_MAGIC) {
            let mut out = Vec::new();
            MultiGzDecoder::new(raw.as_slice())
                .read_to_end(&mut out)
                .map_err(|source| StorageError::Read {
                    path: path.to_string(),
                    source,
                })?;
            out
        } else {
            raw
        };

        let local = self.work_dir.join(self.local_name(path));
        tokio::fs::write(&local, data)
            .await
            .map_err(|source| StorageError::Write {
                path: local.display().to_string(),
                source,
            })?;
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    fn locator(root: &str) -> FileLocator {
        FileLocator::new(
            Arc::new(LocalStore),
            root,
            "9999/99/99:99",
            1,
            1,
            std::env::temp_dir(),
        )
        .unwrap()
    }

    #[test]
    fn classifies_each_level() {
        let l = locator("s3://bucket/replay/");
        assert_eq!(l.classify("s3://bucket/replay/").unwrap(), NodeType::Base);
        assert_eq!(l.classify("s3://bucket/replay/2016/").unwrap(), NodeType::Year);
        assert_eq!(
            l.classify("s3://bucket/replay/2016/05/").unwrap(),
            NodeType::Month
        );
        assert_eq!(
            l.classify("s3://bucket/replay/2016/05/01/").unwrap(),
            NodeType::Day
        );
        assert_eq!(
            l.classify("s3://bucket/replay/2016/05/01/13/").unwrap(),
            NodeType::Hour
        );
        assert_eq!(
            l.classify("s3://bucket/replay/2016/05/01/13/traffic.gz").unwrap(),
            NodeType::File
        );
        assert!(l.classify("s3://bucket/replay/notes.txt").is_err());
        assert!(l.classify("s3://bucket/replay/16/").is_err());
    }

    #[test]
    fn root_is_matched_literally() {
        let l = locator("/data/a.b/");
        assert!(l.classify("/data/aXb/2016/").is_err());
        assert_eq!(l.classify("/data/a.b/2016/").unwrap(), NodeType::Year);
    }

    #[test]
    fn successor_chain_ends_at_file() {
        let mut node = NodeType::Base;
        let mut chain = vec![node.label()];
        while let Some(next) = node.successor() {
            chain.push(next.label());
            node = next;
        }
        assert_eq!(chain, vec!["base", "year", "month", "day", "hour", "file"]);
    }

    #[test]
    fn too_recent_compares_accumulated_prefix() {
        let cutoff = "2016/05/01/13";
        assert!(!too_recent("2016", cutoff));
        assert!(too_recent("2017", cutoff));
        assert!(!too_recent("2016/04", cutoff));
        assert!(too_recent("2016/06", cutoff));
        assert!(!too_recent("2016/05/01", cutoff));
        assert!(too_recent("2016/05/02", cutoff));
        assert!(!too_recent("2016/05/01/13", cutoff));
        assert!(too_recent("2016/05/01/14", cutoff));
        // An earlier month with a later day is still in range.
        assert!(!too_recent("2016/04/30", cutoff));
    }

    #[test]
    fn sharding_partitions_when_jobs_fit() {
        for total in 1..=5u64 {
            let count = 5;
            let mut owners = vec![0; count];
            for job in 1..=total {
                for (i, owner) in owners.iter_mut().enumerate() {
                    if for_this_job(i, count, job, total) {
                        *owner += 1;
                    }
                }
            }
            assert!(owners.iter().all(|&n| n == 1), "total {}: {:?}", total, owners);
        }
    }

    #[test]
    fn sharding_overlaps_when_jobs_exceed_files() {
        // Three files, five jobs: jobs 4 and 5 reuse the files of jobs 1 and 2.
        let picked = |job| {
            (0..3)
                .filter(|&i| for_this_job(i, 3, job, 5))
                .collect::<Vec<_>>()
        };
        assert_eq!(picked(1), vec![0]);
        assert_eq!(picked(2), vec![1]);
        assert_eq!(picked(3), vec![2]);
        assert_eq!(picked(4), vec![0]);
        assert_eq!(picked(5), vec![1]);
        assert!(!for_this_job(0, 0, 1, 1));
    }

    #[test]
    fn local_names_include_date_path() {
        let l = locator("/data/replay");
        assert_eq!(
            l.local_name("/data/replay/2016/05/01/13/traffic.log.gz"),
            "2016_05_01_13_traffic.txt"
        );
    }

    #[tokio::test]
    async fn acquire_gunzips_compressed_files() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let src = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let hour = src.path().join("2016/05/01/13");
        std::fs::create_dir_all(&hour).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        std::fs::write(hour.join("a.gz"), encoder.finish().unwrap()).unwrap();
        std::fs::write(hour.join("b.log"), b"plain").unwrap();

        let root = format!("{}/", src.path().display());
        let l = FileLocator::new(
            Arc::new(LocalStore),
            &root,
            "9999/99/99:99",
            1,
            1,
            work.path().to_path_buf(),
        )
        .unwrap();

        let a = l.acquire(&format!("{}2016/05/01/13/a.gz", root)).await.unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(a.file_name().unwrap(), "2016_05_01_13_a.txt");

        let b = l.acquire(&format!("{}2016/05/01/13/b.log", root)).await.unwrap();
        assert_eq!(std::fs::read(&b).unwrap(), b"plain");
    }
}
