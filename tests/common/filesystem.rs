//! Temporary document roots.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn file(self, rel: &str, content: impl AsRef<[u8]>) -> Self {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("fixture dirs");
        }
        fs::write(&path, content).expect("fixture file");
        self
    }

    pub fn dir(self, rel: &str) -> Self {
        fs::create_dir_all(self.path(rel)).expect("fixture dir");
        self
    }

    /// A `/bin/sh` script with the execute bit set.
    pub fn script(self, rel: &str, body: &str) -> Self {
        let fixture = self.file(rel, format!("#!/bin/sh\n{}", body));
        let path = fixture.path(rel);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        fixture
    }
}
