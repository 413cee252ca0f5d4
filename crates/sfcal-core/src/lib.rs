use anyhow::{anyhow, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

mod ids;
mod table;

pub use ids::{ChannelId, IdError, RunId};
pub use table::{cell_text, Table, TableError};

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256:{}", hex::encode(digest))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
    Ok(sha256_bytes(&bytes))
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let bytes = fs::read(path).map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| anyhow!("parse {}: {}", path.display(), e))
}

/// Parses JSON or YAML depending on the file extension.
pub fn load_structured_file(path: &Path) -> Result<Value> {
    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => {
            let data = fs::read_to_string(path).map_err(|e| anyhow!("read {}: {}", path.display(), e))?;
            serde_yaml::from_str(&data).map_err(|e| anyhow!("parse {}: {}", path.display(), e))
        }
        _ => load_json_file(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sfcal_core_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn sha256_bytes_is_prefixed_hex() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn structured_loader_handles_json_and_yaml() {
        let root = temp_root("loader");
        let json_path = root.join("settings.json");
        fs::write(&json_path, r#"{"data_path": "/data", "n": 2}"#).expect("write json");
        let yaml_path = root.join("settings.yaml");
        fs::write(&yaml_path, "data_path: /data\nn: 2\n").expect("write yaml");

        let expected = json!({"data_path": "/data", "n": 2});
        assert_eq!(load_structured_file(&json_path).expect("json"), expected);
        assert_eq!(load_structured_file(&yaml_path).expect("yaml"), expected);

        let err = load_json_file(&root.join("missing.json")).expect_err("missing");
        assert!(err.to_string().contains("missing.json"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }
}
