use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Vehicle, VehicleOptions};
use crate::nodes::NodeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile name '{0}' is not a plain file stem")]
    InvalidName(String),
    #[error("profile '{name}' not found under {}", .root.display())]
    NotFound { name: String, root: PathBuf },
    #[error("could not read profiles from {}: {error}", .path.display())]
    Io { path: PathBuf, error: std::io::Error },
    #[error("profile '{name}' is malformed: {error}")]
    Parse { name: String, error: serde_json::Error },
    #[error("profile '{name}' uses unknown node type '{node_type}'")]
    UnknownNodeType { name: String, node_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileNode {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub args: Value,
}

/// A named vehicle layout: `<profiles_root>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub vehicle_name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<ProfileNode>,
}

impl Profile {
    /// Every node type must be known to `registry`.
    pub fn validate(&self, registry: &NodeRegistry) -> Result<(), ProfileError> {
        match self.nodes.iter().find(|n| !registry.contains(&n.node_type)) {
            Some(n) => Err(ProfileError::UnknownNodeType {
                name: self.name.clone(),
                node_type: n.node_type.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn into_vehicle(self, mut options: VehicleOptions) -> Vehicle {
        if let Some(name) = self.vehicle_name {
            options.name = name;
        }
        let mut vehicle = Vehicle::new(options);
        for node in self.nodes {
            vehicle.register(node.node_type, node.args);
        }
        vehicle
    }
}

/// Stems of all `*.json` files under `root`, sorted.
pub fn list_profiles(root: &Path) -> Result<Vec<String>, ProfileError> {
    let entries = fs::read_dir(root).map_err(|error| ProfileError::Io { path: root.to_path_buf(), error })?;
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_owned))
        .collect();
    names.sort();
    Ok(names)
}

pub fn load_profile(root: &Path, name: &str) -> Result<Profile, ProfileError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(ProfileError::InvalidName(name.to_string()));
    }
    let path = root.join(format!("{name}.json"));
    if !path.is_file() {
        return Err(ProfileError::NotFound { name: name.to_string(), root: root.to_path_buf() });
    }
    let raw = fs::read_to_string(&path).map_err(|error| ProfileError::Io { path: path.clone(), error })?;
    let mut profile: Profile =
        serde_json::from_str(&raw).map_err(|error| ProfileError::Parse { name: name.to_string(), error })?;
    profile.name = name.to_string();
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, file: &str, body: &str) {
        fs::write(dir.join(file), body).unwrap();
    }

    #[test]
    fn lists_json_stems_only() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "default.json", "{}");
        write(dir.path(), "demo.json", "{}");
        write(dir.path(), "notes.txt", "");
        fs::create_dir(dir.path().join("nested.json")).unwrap();
        assert_eq!(list_profiles(dir.path()).unwrap(), vec!["default", "demo"]);
    }

    #[test]
    fn loads_nodes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "demo.json",
            r#"{"vehicle_name": "Kitt", "nodes": [
                {"type": "constant", "args": {"value": 42}},
                {"type": "increment"}
            ]}"#,
        );
        let p = load_profile(dir.path(), "demo").unwrap();
        assert_eq!(p.name, "demo");
        assert_eq!(p.vehicle_name.as_deref(), Some("Kitt"));
        assert_eq!(p.nodes[0].args, json!({"value": 42}));
        assert_eq!(p.nodes[1].node_type, "increment");
        assert!(p.nodes[1].args.is_null());
        assert!(p.validate(&NodeRegistry::builtin()).is_ok());
    }

    #[test]
    fn missing_bad_and_unknown_profiles() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_profile(dir.path(), "nope"), Err(ProfileError::NotFound { .. })));
        assert!(matches!(load_profile(dir.path(), "../etc"), Err(ProfileError::InvalidName(_))));

        write(dir.path(), "broken.json", "{ nodes: ");
        assert!(matches!(load_profile(dir.path(), "broken"), Err(ProfileError::Parse { .. })));

        write(dir.path(), "odd.json", r#"{"nodes": [{"type": "lidar"}]}"#);
        let p = load_profile(dir.path(), "odd").unwrap();
        assert!(matches!(
            p.validate(&NodeRegistry::builtin()),
            Err(ProfileError::UnknownNodeType { node_type, .. }) if node_type == "lidar"
        ));
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(list_profiles(&dir.path().join("absent")), Err(ProfileError::Io { .. })));
    }
}
