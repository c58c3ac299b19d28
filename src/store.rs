//! Profiles, subscriptions and settings persisted as JSON under the user
//! config directory.
//!
//! Missing or unreadable files load as empty defaults. Every mutating
//! operation writes its file back before returning.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, StoreError};
use crate::link::{self, ServerProfile};
use crate::session::DEFAULT_LOCAL_PORT;
use crate::subscription::{self, FetchResult, SubscriptionQuota};

pub const APP_DIR: &str = "socksicle";
const SERVERS_FILE: &str = "servers.json";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub servers: Vec<ServerProfile>,
    #[serde(default)]
    pub traffic: Option<SubscriptionQuota>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Kept as a string on disk.
    pub local_port: String,
    pub auto_connect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT.to_string(),
            auto_connect: false,
        }
    }
}

impl Settings {
    /// Parsed port, falling back to 1080 for junk or zero.
    pub fn local_port(&self) -> u16 {
        match self.local_port.trim().parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => DEFAULT_LOCAL_PORT,
        }
    }
}

/// Import/export document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportBundle {
    pub manual_servers: Vec<ServerProfile>,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub servers: usize,
    pub subscriptions: usize,
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> StoreError {
    StoreError::Json {
        path: path.display().to_string(),
        source,
    }
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let raw = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("cannot read {}: {e}", path.display());
            return T::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("ignoring malformed {}: {e}", path.display());
            T::default()
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| json_error(path, e))?;
    fs::write(path, content).map_err(|e| io_error(path, e))
}

/// Decodes fetched links, skipping the ones that do not parse.
fn decode_links(links: &[String]) -> Vec<ServerProfile> {
    links
        .iter()
        .filter_map(|raw| match link::decode(raw) {
            Ok(profile) => Some(profile),
            Err(e) => {
                log::warn!("skipping subscription entry: {e}");
                None
            }
        })
        .collect()
}

pub struct Store {
    dir: PathBuf,
    servers: Vec<ServerProfile>,
    subscriptions: Vec<Subscription>,
    settings: Settings,
}

impl Store {
    pub fn default_dir() -> Result<PathBuf, StoreError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(StoreError::NoConfigDir)
    }

    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_dir()?)
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let store = Self {
            servers: load_json(&dir.join(SERVERS_FILE)),
            subscriptions: load_json(&dir.join(SUBSCRIPTIONS_FILE)),
            settings: load_json(&dir.join(SETTINGS_FILE)),
            dir,
        };
        log::debug!(
            "loaded {} servers, {} subscriptions from {}",
            store.servers.len(),
            store.subscriptions.len(),
            store.dir.display()
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn servers(&self) -> &[ServerProfile] {
        &self.servers
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Manual profiles first, then each subscription's in order.
    pub fn all_profiles(&self) -> Vec<&ServerProfile> {
        self.servers
            .iter()
            .chain(self.subscriptions.iter().flat_map(|sub| sub.servers.iter()))
            .collect()
    }

    fn save_servers(&self) -> Result<(), StoreError> {
        save_json(&self.dir.join(SERVERS_FILE), &self.servers)
    }

    fn save_subscriptions(&self) -> Result<(), StoreError> {
        save_json(&self.dir.join(SUBSCRIPTIONS_FILE), &self.subscriptions)
    }

    pub fn set_settings(&mut self, settings: Settings) -> Result<(), StoreError> {
        save_json(&self.dir.join(SETTINGS_FILE), &settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Adds a manual profile. Adding a link that is already stored returns the
    /// stored profile unchanged.
    pub fn add_server(&mut self, raw: &str) -> Result<ServerProfile, Error> {
        let profile = link::decode(raw)?;
        if let Some(existing) = self.servers.iter().find(|p| **p == profile) {
            return Ok(existing.clone());
        }
        self.servers.push(profile.clone());
        self.save_servers()?;
        log::info!("added server {}", profile.name());
        Ok(profile)
    }

    pub fn remove_server(&mut self, index: usize) -> Result<ServerProfile, StoreError> {
        if index >= self.servers.len() {
            return Err(StoreError::BadIndex(index));
        }
        let removed = self.servers.remove(index);
        self.save_servers()?;
        Ok(removed)
    }

    /// Fetches `url` and stores it as a new subscription. Returns the number
    /// of servers it brought in.
    pub async fn add_subscription(&mut self, name: &str, url: &str) -> Result<usize, StoreError> {
        if self.subscriptions.iter().any(|s| s.name == name || s.url == url) {
            return Err(StoreError::DuplicateSubscription(name.to_string()));
        }
        let fetched = subscription::fetch(url).await;
        self.insert_subscription(name, url, fetched)
    }

    fn insert_subscription(
        &mut self,
        name: &str,
        url: &str,
        fetched: FetchResult,
    ) -> Result<usize, StoreError> {
        let servers = decode_links(&fetched.links);
        if servers.is_empty() {
            return Err(StoreError::EmptySubscription);
        }
        let count = servers.len();
        self.subscriptions.push(Subscription {
            name: name.to_string(),
            url: url.to_string(),
            servers,
            traffic: fetched.quota,
        });
        self.save_subscriptions()?;
        log::info!("added subscription {name} with {count} servers");
        Ok(count)
    }

    /// Re-fetches a subscription and overwrites its servers and quota.
    /// Returns how many keys were not present before. An empty fetch leaves
    /// the stored data alone.
    pub async fn update_subscription(&mut self, name: &str) -> Result<usize, StoreError> {
        let url = self
            .subscriptions
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.url.clone())
            .ok_or_else(|| StoreError::UnknownSubscription(name.to_string()))?;
        let fetched = subscription::fetch(&url).await;
        self.replace_subscription(name, fetched)
    }

    fn replace_subscription(&mut self, name: &str, fetched: FetchResult) -> Result<usize, StoreError> {
        let servers = decode_links(&fetched.links);
        if servers.is_empty() {
            return Err(StoreError::EmptySubscription);
        }
        let sub = self
            .subscriptions
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| StoreError::UnknownSubscription(name.to_string()))?;
        let added = servers
            .iter()
            .filter(|fresh| !sub.servers.iter().any(|old| old.key() == fresh.key()))
            .count();
        sub.servers = servers;
        sub.traffic = fetched.quota;
        self.save_subscriptions()?;
        log::info!("updated subscription {name}: {added} new servers");
        Ok(added)
    }

    pub fn remove_subscription(&mut self, name: &str) -> Result<Subscription, StoreError> {
        let index = self
            .subscriptions
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| StoreError::UnknownSubscription(name.to_string()))?;
        let removed = self.subscriptions.remove(index);
        self.save_subscriptions()?;
        Ok(removed)
    }

    pub fn export(&self) -> ExportBundle {
        ExportBundle {
            manual_servers: self.servers.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }

    pub fn export_to(&self, path: &Path) -> Result<(), StoreError> {
        save_json(path, &self.export())
    }

    /// Merges a bundle, skipping profiles whose key and subscriptions whose
    /// url are already stored.
    /// `name`, or `name (2)`, `name (3)`... when a subscription already has it.
    fn unused_name(&self, name: &str) -> String {
        let taken = |candidate: &str| self.subscriptions.iter().any(|s| s.name == candidate);
        if !taken(name) {
            return name.to_string();
        }
        (2..)
            .map(|n| format!("{name} ({n})"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    pub fn import(&mut self, bundle: ExportBundle) -> Result<ImportSummary, StoreError> {
        let mut summary = ImportSummary::default();
        for profile in bundle.manual_servers {
            if !self.servers.contains(&profile) {
                self.servers.push(profile);
                summary.servers += 1;
            }
        }
        for mut sub in bundle.subscriptions {
            if !self.subscriptions.iter().any(|s| s.url == sub.url) {
                sub.name = self.unused_name(&sub.name);
                self.subscriptions.push(sub);
                summary.subscriptions += 1;
            }
        }
        if summary.servers > 0 {
            self.save_servers()?;
        }
        if summary.subscriptions > 0 {
            self.save_subscriptions()?;
        }
        Ok(summary)
    }

    pub fn import_from(&mut self, path: &Path) -> Result<ImportSummary, StoreError> {
        let raw = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        let bundle: ExportBundle = serde_json::from_str(&raw).map_err(|e| json_error(path, e))?;
        self.import(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

    fn temp_dir() -> PathBuf {
        let n = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("socksicle-store-{}-{n}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn link_for(host: &str, name: &str) -> String {
        let payload = URL_SAFE.encode(format!("aes-256-gcm:pw@{host}:8388"));
        format!("ss://{payload}#{name}")
    }

    fn fetched(links: &[String]) -> FetchResult {
        FetchResult {
            links: links.to_vec(),
            quota: Some(SubscriptionQuota {
                used_bytes: 3000,
                total_bytes: 100000,
                expire_epoch_seconds: 1700000000,
            }),
        }
    }

    #[test]
    fn test_missing_files_load_defaults() {
        let dir = temp_dir();
        let store = Store::open(&dir).unwrap();
        assert!(store.servers().is_empty());
        assert!(store.subscriptions().is_empty());
        assert_eq!(store.settings().local_port(), 1080);
        assert!(!store.settings().auto_connect);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_malformed_file_loads_default() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SERVERS_FILE), "{not json").unwrap();
        let store = Store::open(&dir).unwrap();
        assert!(store.servers().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_servers_persist_across_reopen() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        let added = store.add_server(&link_for("1.1.1.1", "one")).unwrap();
        store.add_server(&link_for("2.2.2.2", "two")).unwrap();
        store.add_server(&link_for("1.1.1.1", "one")).unwrap();
        assert_eq!(store.servers().len(), 2);

        let raw = fs::read_to_string(dir.join(SERVERS_FILE)).unwrap();
        assert!(raw.contains("\"port\": \"8388\""));

        let reopened = Store::open(&dir).unwrap();
        assert_eq!(reopened.servers().len(), 2);
        assert_eq!(reopened.servers()[0], added);
        assert_eq!(reopened.servers()[0].password(), "pw");

        let mut reopened = reopened;
        let removed = reopened.remove_server(0).unwrap();
        assert_eq!(removed.name(), "one");
        assert!(matches!(reopened.remove_server(5), Err(StoreError::BadIndex(5))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_add_server_rejects_bad_link() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        let err = store.add_server("http://not-a-link").unwrap_err();
        assert_eq!(err.code(), "IMPORT_INVALID");
        assert!(store.servers().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_subscription_update_counts_new_keys() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        let first = vec![link_for("1.1.1.1", "a"), link_for("2.2.2.2", "b"), "garbage".to_string()];
        let count = store
            .insert_subscription("sub", "https://example.com/sub", fetched(&first))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.subscriptions()[0].traffic.map(|q| q.used_bytes), Some(3000));

        let second = vec![link_for("2.2.2.2", "b"), link_for("3.3.3.3", "c")];
        let added = store.replace_subscription("sub", fetched(&second)).unwrap();
        assert_eq!(added, 1);
        let names: Vec<&str> = store.subscriptions()[0].servers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["b", "c"]);

        assert!(matches!(
            store.replace_subscription("sub", FetchResult::default()),
            Err(StoreError::EmptySubscription)
        ));
        assert_eq!(store.subscriptions()[0].servers.len(), 2);
        assert!(matches!(
            store.replace_subscription("nope", fetched(&second)),
            Err(StoreError::UnknownSubscription(_))
        ));

        let reopened = Store::open(&dir).unwrap();
        assert_eq!(reopened.subscriptions()[0].servers.len(), 2);
        assert_eq!(reopened.all_profiles().len(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        store
            .insert_subscription("sub", "https://example.com/sub", fetched(&[link_for("1.1.1.1", "a")]))
            .unwrap();
        let err = store.add_subscription("other", "https://example.com/sub").await.unwrap_err();
        assert_eq!(err.code(), "SUB_EXISTS");
        store.remove_subscription("sub").unwrap();
        assert!(store.subscriptions().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_export_import_dedups() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        store.add_server(&link_for("1.1.1.1", "a")).unwrap();
        store
            .insert_subscription("sub", "https://example.com/sub", fetched(&[link_for("2.2.2.2", "b")]))
            .unwrap();
        let export = dir.join("export.json");
        store.export_to(&export).unwrap();

        let raw = fs::read_to_string(&export).unwrap();
        assert!(raw.contains("manual_servers"));
        assert!(raw.contains("\"used\": 3000"));

        let summary = store.import_from(&export).unwrap();
        assert_eq!(summary, ImportSummary::default());

        let other_dir = temp_dir();
        let mut other = Store::open(&other_dir).unwrap();
        other.add_server(&link_for("9.9.9.9", "z")).unwrap();
        let summary = other.import_from(&export).unwrap();
        assert_eq!(summary, ImportSummary { servers: 1, subscriptions: 1 });
        assert_eq!(other.all_profiles().len(), 3);

        let _ = fs::remove_dir_all(dir);
        let _ = fs::remove_dir_all(other_dir);
    }

    #[test]
    fn test_import_renames_colliding_subscription() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        store
            .insert_subscription("sub", "https://example.com/a", fetched(&[link_for("2.2.2.2", "b")]))
            .unwrap();
        let export = dir.join("export.json");
        store.export_to(&export).unwrap();

        let other_dir = temp_dir();
        let mut other = Store::open(&other_dir).unwrap();
        other
            .insert_subscription("sub", "https://example.com/b", fetched(&[link_for("3.3.3.3", "c")]))
            .unwrap();
        other
            .insert_subscription("sub (2)", "https://example.com/c", fetched(&[link_for("4.4.4.4", "d")]))
            .unwrap();
        let summary = other.import_from(&export).unwrap();
        assert_eq!(summary.subscriptions, 1);

        let names: Vec<&str> = other.subscriptions().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "sub (2)", "sub (3)"]);
        assert_eq!(other.subscriptions()[2].url, "https://example.com/a");
        other.remove_subscription("sub").unwrap();
        assert_eq!(other.subscriptions()[0].url, "https://example.com/c");

        let _ = fs::remove_dir_all(dir);
        let _ = fs::remove_dir_all(other_dir);
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = temp_dir();
        let mut store = Store::open(&dir).unwrap();
        store
            .set_settings(Settings {
                local_port: "1090".to_string(),
                auto_connect: true,
            })
            .unwrap();
        let raw = fs::read_to_string(dir.join(SETTINGS_FILE)).unwrap();
        assert!(raw.contains("\"local_port\": \"1090\""));

        let reopened = Store::open(&dir).unwrap();
        assert_eq!(reopened.settings().local_port(), 1090);
        assert!(reopened.settings().auto_connect);

        let junk = Settings {
            local_port: "abc".to_string(),
            auto_connect: false,
        };
        assert_eq!(junk.local_port(), 1080);
        let _ = fs::remove_dir_all(dir);
    }
}
