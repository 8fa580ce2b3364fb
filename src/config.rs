//! Route file loading
//!
//! The route file is a YAML map from route name to route settings:
//!
//! ```yaml
//! web:
//!   in: tls://0.0.0.0:8443
//!   out: tcp://127.0.0.1:8080
//!   clientca: inner
//! dns:
//!   in: udp://:5353
//!   out: udp://10.0.0.2:53
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sockbridge_relay::RouteConfig;

/// File name searched for in the home directory, then the working directory
pub const DEFAULT_CONFIG_NAME: &str = ".sockbridge.yaml";

/// First existing default route file
pub fn default_config_path() -> Option<PathBuf> {
    let mut candidates = dirs::home_dir()
        .map(|home| home.join(DEFAULT_CONFIG_NAME))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(DEFAULT_CONFIG_NAME)));

    candidates.find(|path| path.is_file())
}

/// Parse route file content; route names come from the map keys
pub fn parse_routes(content: &str) -> Result<Vec<RouteConfig>> {
    let entries: Option<BTreeMap<String, RouteConfig>> =
        serde_yaml::from_str(content).context("Failed to parse route file")?;

    let routes: Vec<RouteConfig> = entries
        .unwrap_or_default()
        .into_iter()
        .map(|(name, mut route)| {
            route.name = name;
            route
        })
        .collect();

    if routes.is_empty() {
        bail!("Route file defines no routes");
    }

    Ok(routes)
}

/// Load routes from a YAML file
pub fn load_routes(path: &Path) -> Result<Vec<RouteConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read route file {:?}", path))?;
    parse_routes(&content).with_context(|| format!("Invalid route file {:?}", path))
}
