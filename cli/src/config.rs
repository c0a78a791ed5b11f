use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

use basket_core::models::CartPolicy;

const DATA_DIR_ENV: &str = "BASKET_DATA_DIR";
const MAX_ITEM_QUANTITY_ENV: &str = "BASKET_MAX_ITEM_QUANTITY";

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub policy: CartPolicy,
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => ProjectDirs::from("", "", "basket")
                .context("Could not determine home directory")?
                .data_dir()
                .to_path_buf(),
        };
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = data_dir.join("basket.db");
        let policy = policy_from(std::env::var(MAX_ITEM_QUANTITY_ENV).ok().as_deref())?;

        Ok(Config {
            db_path,
            data_dir,
            policy,
        })
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        let path = self.data_dir.join("api_key");

        if path.exists() {
            let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Ok((key, false));
            }
        }

        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        tracing::info!(path = %path.display(), "generated new API key");
        Ok((key, true))
    }
}

fn policy_from(max_item_quantity: Option<&str>) -> Result<CartPolicy> {
    match max_item_quantity.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(CartPolicy::default()),
        Some(raw) => {
            let max: i64 = raw
                .parse()
                .with_context(|| format!("{MAX_ITEM_QUANTITY_ENV} must be a number, got '{raw}'"))?;
            CartPolicy::new(max).with_context(|| format!("Invalid {MAX_ITEM_QUANTITY_ENV}"))
        }
    }
}
