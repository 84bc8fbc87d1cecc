use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Local files currently being written by a worker.
///
/// Two workers never write the same target at once: the second one gets `None`
/// from [`OpenFiles::try_claim`] and postpones its item.
#[derive(Clone, Default, Debug)]
pub struct OpenFiles {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl OpenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self, path: &Path) -> Option<OpenFileGuard> {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        if paths.insert(path.to_path_buf()) {
            Some(OpenFileGuard {
                registry: self.clone(),
                path: path.to_path_buf(),
            })
        } else {
            None
        }
    }

    pub fn is_open(&self, path: &Path) -> bool {
        let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.contains(path)
    }
}

/// Releases the claim when dropped.
#[derive(Debug)]
pub struct OpenFileGuard {
    registry: OpenFiles,
    path: PathBuf,
}

impl Drop for OpenFileGuard {
    fn drop(&mut self) {
        let mut paths = self.registry.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.remove(&self.path);
    }
}
