//! App Routing
//!
//! Decides which installed applications are sent through the tunnel on
//! platforms that support per-app VPN rules.
//!
//! The user's selection is stored as a pipe-delimited list of OS user names
//! (`"u0_a12|u0_a57"`). With at least one selected app the interface uses an
//! allow-list; otherwise it tunnels everything except this process.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Permission that marks an application as network capable
pub const NETWORK_PERMISSION: &str = "android.permission.INTERNET";

/// One entry of the installed-application inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub package_id: String,
    pub uid: u32,
    /// OS user name for `uid`, matched against the selection policy
    pub user_name: String,
    /// Display label; falls back to the package id
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub declared_permissions: Vec<String>,
    #[serde(default)]
    pub is_system_app: bool,
}

impl InstalledApp {
    /// Declares network access, or is privileged and gets it implicitly
    pub fn uses_network(&self) -> bool {
        self.is_system_app
            || self
                .declared_permissions
                .iter()
                .any(|p| p == NETWORK_PERMISSION)
    }
}

/// Routing view of an installed application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedApplication {
    pub package_id: String,
    pub uid: u32,
    pub user_name: String,
    pub label: String,
    pub uses_network: bool,
    pub selected: bool,
}

/// Case-insensitive ordering on display label
pub fn compare_by_label(a: &RoutedApplication, b: &RoutedApplication) -> Ordering {
    a.label
        .to_lowercase()
        .cmp(&b.label.to_lowercase())
}

/// Sorted set of user names selected for tunneling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    names: Vec<String>,
}

impl SelectionSet {
    /// Parse the stored `a|b|c` form. Empty entries are dropped.
    pub fn parse(stored: &str) -> Self {
        let mut names: Vec<String> = stored
            .split('|')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    /// Exact, case-sensitive membership
    pub fn contains(&self, user_name: &str) -> bool {
        self.names
            .binary_search_by(|name| name.as_str().cmp(user_name))
            .is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Policy values read fresh for each command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Pipe-delimited user names selected for tunneling
    #[serde(default)]
    pub selected_apps: String,
}

impl PolicySnapshot {
    pub fn new(selected_apps: impl Into<String>) -> Self {
        Self { selected_apps: selected_apps.into() }
    }

    pub fn selection(&self) -> SelectionSet {
        SelectionSet::parse(&self.selected_apps)
    }
}

/// Source of [`PolicySnapshot`]s
pub trait PolicySource: Send {
    fn snapshot(&self) -> PolicySnapshot;
}

/// A fixed policy
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy(pub PolicySnapshot);

impl PolicySource for StaticPolicy {
    fn snapshot(&self) -> PolicySnapshot {
        self.0.clone()
    }
}

/// Policy read from a TOML file on every snapshot; missing means empty
#[derive(Debug, Clone)]
pub struct FilePolicy {
    path: PathBuf,
}

impl FilePolicy {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl PolicySource for FilePolicy {
    fn snapshot(&self) -> PolicySnapshot {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!("Malformed policy {}: {}", self.path.display(), e);
                PolicySnapshot::default()
            }),
            Err(e) => {
                debug!("No policy at {}: {}", self.path.display(), e);
                PolicySnapshot::default()
            }
        }
    }
}

/// Installed-application inventory
pub trait AppInventory: Send {
    fn installed_apps(&self) -> Vec<InstalledApp>;
}

/// A fixed inventory
#[derive(Debug, Clone, Default)]
pub struct StaticInventory(pub Vec<InstalledApp>);

impl AppInventory for StaticInventory {
    fn installed_apps(&self) -> Vec<InstalledApp> {
        self.0.clone()
    }
}

/// Inventory read from a JSON array of [`InstalledApp`] on every call
#[derive(Debug, Clone)]
pub struct JsonAppInventory {
    path: PathBuf,
}

impl JsonAppInventory {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl AppInventory for JsonAppInventory {
    fn installed_apps(&self) -> Vec<InstalledApp> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read app inventory {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Malformed app inventory {}: {}", self.path.display(), e);
            Vec::new()
        })
    }
}

/// Build the routing view of `installed`.
///
/// Apps without network access are dropped. `own_package` is never marked
/// selected. The result is ordered by label, ignoring case.
pub fn resolve(
    installed: &[InstalledApp],
    policy: &PolicySnapshot,
    own_package: &str,
) -> Vec<RoutedApplication> {
    let selection = policy.selection();

    let mut apps: Vec<RoutedApplication> = installed
        .iter()
        .filter(|app| app.uses_network())
        .map(|app| RoutedApplication {
            package_id: app.package_id.clone(),
            uid: app.uid,
            user_name: app.user_name.clone(),
            label: app
                .label
                .clone()
                .unwrap_or_else(|| app.package_id.clone()),
            uses_network: true,
            selected: app.package_id != own_package && selection.contains(&app.user_name),
        })
        .collect();

    apps.sort_by(compare_by_label);
    debug!(
        "Resolved {} network apps ({} selected)",
        apps.len(),
        apps.iter().filter(|a| a.selected).count()
    );
    apps
}

/// Per-app rule applied to the virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Only these packages are tunneled
    AllowOnly(Vec<String>),
    /// Everything except these packages is tunneled
    DisallowOnly(Vec<String>),
}

/// Turn resolved apps into an allow- or deny-list
pub fn routing_decision(apps: &[RoutedApplication], own_package: &str) -> RoutingDecision {
    let allowed: Vec<String> = apps
        .iter()
        .filter(|app| app.selected && app.package_id != own_package)
        .map(|app| app.package_id.clone())
        .collect();

    if allowed.is_empty() {
        RoutingDecision::DisallowOnly(vec![own_package.to_string()])
    } else {
        RoutingDecision::AllowOnly(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWN: &str = "org.torproject.android";

    fn app(package: &str, user: &str, label: &str, network: bool) -> InstalledApp {
        InstalledApp {
            package_id: package.to_string(),
            uid: 10000,
            user_name: user.to_string(),
            label: Some(label.to_string()),
            declared_permissions: if network {
                vec![NETWORK_PERMISSION.to_string()]
            } else {
                vec!["android.permission.CAMERA".to_string()]
            },
            is_system_app: false,
        }
    }

    #[test]
    fn test_selection_set() {
        let set = SelectionSet::parse("u0_a9|u0_a1||u0_a5|u0_a1");

        assert_eq!(set.len(), 3);
        assert!(set.contains("u0_a5"));
        assert!(!set.contains("U0_A5"));
        assert!(!set.contains("u0_a"));
        assert!(SelectionSet::parse("").is_empty());
    }

    #[test]
    fn test_allow_list_only_network_apps() {
        let installed = vec![
            app("com.a", "A", "Alpha", true),
            app("com.b", "B", "Beta", false),
            app("com.c", "C", "Gamma", true),
        ];

        let apps = resolve(&installed, &PolicySnapshot::new("A|B"), OWN);

        assert_eq!(apps.len(), 2);
        assert_eq!(
            routing_decision(&apps, OWN),
            RoutingDecision::AllowOnly(vec!["com.a".to_string()])
        );
    }

    #[test]
    fn test_empty_policy_excludes_self() {
        let installed = vec![app("com.a", "A", "Alpha", true), app(OWN, "u0_a1", "Orbot", true)];

        let apps = resolve(&installed, &PolicySnapshot::default(), OWN);

        assert_eq!(
            routing_decision(&apps, OWN),
            RoutingDecision::DisallowOnly(vec![OWN.to_string()])
        );
    }

    #[test]
    fn test_own_package_never_selected() {
        let installed = vec![app(OWN, "u0_a1", "Orbot", true)];

        let apps = resolve(&installed, &PolicySnapshot::new("u0_a1"), OWN);

        assert!(!apps[0].selected);
        assert_eq!(
            routing_decision(&apps, OWN),
            RoutingDecision::DisallowOnly(vec![OWN.to_string()])
        );
    }

    #[test]
    fn test_system_apps_use_network() {
        let mut system = app("android.sys", "system", "System", false);
        system.is_system_app = true;

        let apps = resolve(&[system], &PolicySnapshot::new("system"), OWN);

        assert_eq!(apps.len(), 1);
        assert!(apps[0].selected);
    }

    #[test]
    fn test_sorted_by_label_ignoring_case() {
        let installed = vec![
            app("com.z", "z", "zebra", true),
            app("com.a", "a", "Apple", true),
            app("com.m", "m", "mango", true),
        ];
        let mut unlabeled = app("com.b", "b", "", true);
        unlabeled.label = None;

        let mut all = installed;
        all.push(unlabeled);
        let apps = resolve(&all, &PolicySnapshot::default(), OWN);
        let labels: Vec<&str> = apps.iter().map(|a| a.label.as_str()).collect();

        assert_eq!(labels, vec!["Apple", "com.b", "mango", "zebra"]);
    }

    #[test]
    fn test_file_policy_read_fresh() {
        let dir = std::env::temp_dir().join(format!("otun-policy-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policy.toml");
        let policy = FilePolicy::new(&path);

        assert_eq!(policy.snapshot(), PolicySnapshot::default());

        std::fs::write(&path, "selected_apps = \"u0_a1|u0_a2\"\n").unwrap();
        assert_eq!(policy.snapshot().selection().len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_inventory_json() {
        let json = r#"[{"package_id":"com.a","uid":10001,"user_name":"u0_a1",
                        "declared_permissions":["android.permission.INTERNET"]}]"#;
        let apps: Vec<InstalledApp> = serde_json::from_str(json).unwrap();

        assert_eq!(apps[0].label, None);
        assert!(apps[0].uses_network());
    }
}
