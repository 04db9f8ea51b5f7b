use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where signed-up credentials are kept between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_credentials_path")]
    pub credentials_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_path: d_credentials_path(),
        }
    }
}

fn d_credentials_path() -> PathBuf {
    PathBuf::from("./data/cloud_credentials.json")
}
