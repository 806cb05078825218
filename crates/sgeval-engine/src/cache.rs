use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sgeval_core::types::Prediction;

/// File name of a finished evaluation inside its output folder.
pub const RESULTS_FILE_NAME: &str = "eval_results.pytorch";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache file {path} is not a results file: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
}

/// On-disk layout of a results file, bincode-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResults {
    pub predictions: Vec<Prediction>,
}

/// Read-only view of a previous run's results.
#[derive(Debug, Clone)]
pub struct ResultCache {
    output_folder: Option<PathBuf>,
    allow_load: bool,
}

impl ResultCache {
    pub fn new(output_folder: Option<PathBuf>, allow_load: bool) -> Self {
        Self {
            output_folder,
            allow_load,
        }
    }

    pub fn results_path(&self) -> Option<PathBuf> {
        self.output_folder
            .as_ref()
            .map(|dir| dir.join(RESULTS_FILE_NAME))
    }

    /// Path of a reusable results file, or `None` when the run must compute.
    pub fn lookup(&self) -> Option<PathBuf> {
        if !self.allow_load {
            return None;
        }
        self.results_path().filter(|path| path.is_file())
    }

    pub fn load(&self, path: &Path) -> Result<Vec<Prediction>, CacheError> {
        let file = File::open(path).map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cached: CachedResults =
            bincode::deserialize_from(BufReader::new(file)).map_err(|source| CacheError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(cached.predictions)
    }
}
