//! Statement cache.
//!
//! Building statements means re-reading every source spreadsheet, which is
//! the slow half of a run. A finished statement sequence is written to disk
//! as JSON lines keyed by run id; the next run with the same id loads the
//! cached sequence instead of parsing anything.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::statement::Statement;

pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: &Path) -> Self {
        CacheStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.stmts.jsonl"))
    }

    /// Load a cached sequence. A missing file is a clean miss; a file that
    /// exists but fails to parse is an error, not a silent rebuild.
    pub fn load(&self, run_id: &str) -> Result<Option<Vec<Statement>>> {
        let path = self.path_for(run_id);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("opening cache {}", path.display()))
            }
        };

        let mut statements = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading cache {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let statement: Statement = serde_json::from_str(&line)
                .with_context(|| format!("cache {} line {}", path.display(), i + 1))?;
            statements.push(statement);
        }
        Ok(Some(statements))
    }

    pub fn save(&self, run_id: &str, statements: &[Statement]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let path = self.path_for(run_id);
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("writing cache {}", path.display()))?;
        for statement in statements {
            let line = serde_json::to_string(statement)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    pub fn remove(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing cache {}", path.display())),
        }
    }
}
