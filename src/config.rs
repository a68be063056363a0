//! Typed, named, hot-reloadable configuration variables.
//!
//! The convention is "code over file": a module declares the options it
//! consumes with [`Config::lookup`] (name, default, description) and gets a
//! shared [`ConfigVar`] handle back. Loading a YAML snapshot afterwards
//! ([`Config::load_str`] / [`Config::load_file`]) only touches options that
//! were declared; unknown keys are ignored. Every [`ConfigVar::set`] —
//! programmatic or from a reload — notifies registered listeners with the
//! old and the new value, which is how the runtime picks up changes to
//! `fiber.stack_size` and `tcp.connect.timeout` without a restart.
//!
//! ```
//! use filament::config::Config;
//!
//! let workers = Config::lookup::<u32>("server.workers", 4, "worker threads");
//! workers.add_listener(|old, new| {
//!     log::info!(target: "system", "workers changed from {} to {}", old, new);
//! });
//! Config::load_str("server:\n  workers: 8\n").unwrap();
//! assert_eq!(workers.get(), 8);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Bounds every configuration value type must satisfy.
pub trait Value:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<T> Value for T where
    T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// One named option: current value, default and change listeners.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_listener_id: AtomicU64,
}

impl<T: Value> ConfigVar<T> {
    fn new(name: String, default: T, description: String) -> Self {
        ConfigVar {
            name,
            description,
            value: RwLock::new(default),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn get(&self) -> T {
        self.value.read().expect("config value lock").clone()
    }

    /// Replaces the value and notifies listeners with `(old, new)`.
    ///
    /// Listeners run on the calling thread, outside the value lock; setting
    /// the identical value is a no-op and does not notify.
    pub fn set(&self, new: T) {
        let old = {
            let mut value = self.value.write().expect("config value lock");
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };
        let listeners = self.listeners.lock().expect("config listener lock");
        for listener in listeners.values() {
            listener(&old, &new);
        }
    }

    /// Registers a change listener; returns an id for [`remove_listener`].
    ///
    /// The listener may run on an arbitrary thread and must not acquire
    /// runtime locks.
    ///
    /// [`remove_listener`]: Self::remove_listener
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("config listener lock")
            .insert(id, Box::new(listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .expect("config listener lock")
            .remove(&id);
    }
}

/// Type-erased view of a [`ConfigVar`], what the registry stores.
trait Entry: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn apply_yaml(&self, node: &serde_yaml::Value) -> std::result::Result<(), serde_yaml::Error>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Value> Entry for ConfigVar<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn apply_yaml(&self, node: &serde_yaml::Value) -> std::result::Result<(), serde_yaml::Error> {
        let parsed: T = serde_yaml::from_value(node.clone())?;
        self.set(parsed);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn Entry>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Process-wide option registry.
pub struct Config;

impl Config {
    /// Returns the variable registered under `name`, creating it with
    /// `default` on first lookup.
    ///
    /// Names are lowercased and may contain `[a-z0-9._]` only. Looking the
    /// same name up with two different types is a programming error.
    pub fn lookup<T: Value>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>> {
        let name = name.to_ascii_lowercase();
        fatal_assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_'),
            "invalid config name {:?}",
            name
        );

        {
            let registry = REGISTRY.read().expect("config registry lock");
            if let Some(entry) = registry.get(&name) {
                return Self::downcast(&name, entry.clone());
            }
        }

        let mut registry = REGISTRY.write().expect("config registry lock");
        // Raced lookups settle on whichever insert won.
        if let Some(entry) = registry.get(&name) {
            return Self::downcast(&name, entry.clone());
        }
        let var = Arc::new(ConfigVar::new(name.clone(), default, description.to_owned()));
        let entry: Arc<dyn Entry> = var.clone();
        registry.insert(name, entry);
        var
    }

    fn downcast<T: Value>(name: &str, entry: Arc<dyn Entry>) -> Arc<ConfigVar<T>> {
        let existing = entry.type_name();
        match entry.as_any().downcast::<ConfigVar<T>>() {
            Ok(var) => var,
            Err(_) => {
                fatal_assert!(false, "config {:?} already registered as {}", name, existing);
                unreachable!()
            }
        }
    }

    /// Applies a YAML snapshot to every declared option it mentions.
    ///
    /// Nested mappings flatten to dot-separated lowercase keys, so
    /// `tcp: {connect: {timeout: 100}}` addresses `tcp.connect.timeout`.
    /// Unknown keys are skipped. All applicable keys are applied even when
    /// some fail to parse; the first parse failure is returned.
    pub fn load_str(yaml: &str) -> Result<()> {
        let root: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|source| Error::ConfigParse {
                name: "<root>".into(),
                source,
            })?;
        let mut flat = Vec::new();
        flatten("", &root, &mut flat);

        let mut first_err = None;
        let registry = REGISTRY.read().expect("config registry lock");
        for (key, node) in &flat {
            if let Some(entry) = registry.get(key) {
                if let Err(source) = entry.apply_yaml(node) {
                    log::error!(target: "system", "config reload: option {:?}: {}", key, source);
                    first_err.get_or_insert(Error::ConfigParse {
                        name: key.clone(),
                        source,
                    });
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Reads `path` and applies it with [`load_str`](Self::load_str).
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        Self::load_str(&text)
    }
}

fn flatten(prefix: &str, node: &serde_yaml::Value, out: &mut Vec<(String, serde_yaml::Value)>) {
    if let serde_yaml::Value::Mapping(map) = node {
        for (key, child) in map {
            let key = match key.as_str() {
                Some(k) => k.to_ascii_lowercase(),
                None => continue,
            };
            let path = if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            };
            flatten(&path, child, out);
        }
    } else if !prefix.is_empty() {
        out.push((prefix.to_owned(), node.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn lookup_returns_default_then_existing() {
        let a = Config::lookup::<u32>("test.lookup.value", 7, "first");
        assert_eq!(a.get(), 7);
        a.set(9);
        let b = Config::lookup::<u32>("test.lookup.value", 7, "second");
        assert_eq!(b.get(), 9);
    }

    #[test]
    fn set_notifies_listeners_once_per_change() {
        let var = Config::lookup::<i64>("test.listener.value", 1, "");
        let seen = Arc::new(AtomicI64::new(0));
        let seen2 = seen.clone();
        let id = var.add_listener(move |old, new| {
            seen2.store(old * 100 + new, Ordering::SeqCst);
        });
        var.set(2);
        assert_eq!(seen.load(Ordering::SeqCst), 102);
        // Same value again: no notification.
        var.set(2);
        assert_eq!(seen.load(Ordering::SeqCst), 102);
        var.remove_listener(id);
        var.set(3);
        assert_eq!(seen.load(Ordering::SeqCst), 102);
    }

    #[test]
    fn yaml_snapshot_applies_nested_keys() {
        let var = Config::lookup::<i64>("snap.connect.timeout", 5000, "");
        Config::load_str("snap:\n  connect:\n    timeout: 250\n  unknown: 1\n").unwrap();
        assert_eq!(var.get(), 250);
    }

    #[test]
    fn yaml_type_error_is_reported_but_others_apply() {
        let good = Config::lookup::<u32>("mix.good", 1, "");
        let bad = Config::lookup::<u32>("mix.bad", 1, "");
        let err = Config::load_str("mix:\n  good: 5\n  bad: not-a-number\n");
        assert!(err.is_err());
        assert_eq!(good.get(), 5);
        assert_eq!(bad.get(), 1);
    }

    #[test]
    fn load_file_round_trip() {
        use std::io::Write;
        let var = Config::lookup::<u32>("file.stack_size", 131072, "");
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "file:\n  stack_size: 65536\n").unwrap();
        Config::load_file(f.path()).unwrap();
        assert_eq!(var.get(), 65536);
    }
}
