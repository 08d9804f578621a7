//! Runtime-tunable parameters in a flat registry keyed by path
//!
//! A `set` runs in phases. The candidate is validated under a read lock,
//! change callbacks run with no lock held and may reject it, and only then
//! is it committed under a write lock. Commit hooks run last, again with no
//! lock held, so side effects only ever see committed values. Callbacks and
//! hooks may read or set other parameters freely.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::{Error, Result};

type Check = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Sees `(old, new)` before a value is committed; an `Err` cancels the change.
pub type Callback = Arc<dyn Fn(&str, &str) -> std::result::Result<(), String> + Send + Sync>;

/// Sees the new value once it is committed.
pub type CommitHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Public description of one parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamInfo {
    pub path: String,
    pub description: String,
    pub default: String,
    pub value: String,
}

/// The get/set/describe capability shared by anything holding parameters
pub trait Configurable {
    fn get(&self, path: &str) -> Result<String>;

    fn set(&self, path: &str, value: &str) -> Result<()>;

    fn describe(&self) -> Vec<ParamInfo>;
}

struct Entry {
    description: String,
    default: String,
    value: String,
    check: Check,
    callbacks: Vec<Callback>,
    hooks: Vec<CommitHook>,
    /// Bumped on every commit
    version: u64,
}

#[derive(Default)]
pub struct ParameterRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

fn param_err(path: &str, reason: impl Into<String>) -> Error {
    Error::Param {
        name: path.to_string(),
        reason: reason.into(),
    }
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a parameter parsed as `T`, optionally restricted to `range`.
    pub fn register<T>(&self, path: &str, description: &str, default: T, range: Option<(T, T)>) -> Result<()>
    where
        T: FromStr + PartialOrd + Display + Send + Sync + 'static,
        T::Err: Display,
    {
        let check: Check = Arc::new(move |s: &str| -> std::result::Result<(), String> {
            let v: T = s.trim().parse().map_err(|e: T::Err| e.to_string())?;
            match &range {
                Some((lo, hi)) if v < *lo || v > *hi => Err(format!("{v} is outside [{lo}, {hi}]")),
                _ => Ok(()),
            }
        });
        self.register_with(path, description, &default.to_string(), check)
    }

    /// Registers a parameter limited to a fixed set of values.
    pub fn register_choice(&self, path: &str, description: &str, default: &str, choices: &[&str]) -> Result<()> {
        let choices: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
        let check: Check = Arc::new(move |s: &str| {
            if choices.iter().any(|c| c == s) {
                Ok(())
            } else {
                Err(format!("must be one of {}", choices.join("|")))
            }
        });
        self.register_with(path, description, default, check)
    }

    fn register_with(&self, path: &str, description: &str, default: &str, check: Check) -> Result<()> {
        check(default).map_err(|e| param_err(path, format!("bad default: {e}")))?;
        let mut entries = self.write();
        if entries.contains_key(path) {
            return Err(param_err(path, "already registered"));
        }
        entries.insert(
            path.to_string(),
            Entry {
                description: description.to_string(),
                default: default.to_string(),
                value: default.to_string(),
                check,
                callbacks: Vec::new(),
                hooks: Vec::new(),
                version: 0,
            },
        );
        Ok(())
    }

    /// Adds a callback run on every change of `path`.
    pub fn on_change(&self, path: &str, cb: Callback) -> Result<()> {
        let mut entries = self.write();
        let entry = entries.get_mut(path).ok_or_else(|| param_err(path, "no such parameter"))?;
        entry.callbacks.push(cb);
        Ok(())
    }

    /// Adds a hook run after every committed change of `path`.
    pub fn on_commit(&self, path: &str, hook: CommitHook) -> Result<()> {
        let mut entries = self.write();
        let entry = entries.get_mut(path).ok_or_else(|| param_err(path, "no such parameter"))?;
        entry.hooks.push(hook);
        Ok(())
    }

    /// Current value parsed as `T`
    pub fn get_as<T>(&self, path: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let v = Configurable::get(self, path)?;
        v.trim().parse().map_err(|e: T::Err| param_err(path, e.to_string()))
    }

    /// Path and value of every parameter, sorted by path
    pub fn list(&self) -> Vec<(String, String)> {
        self.read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Restores every parameter to its default, running callbacks.
    pub fn reset(&self) -> Result<()> {
        let defaults: Vec<(String, String)> = self
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.default.clone()))
            .collect();
        for (path, value) in defaults {
            Configurable::set(self, &path, &value)?;
        }
        Ok(())
    }
}

impl Configurable for ParameterRegistry {
    fn get(&self, path: &str) -> Result<String> {
        self.read()
            .get(path)
            .map(|e| e.value.clone())
            .ok_or_else(|| param_err(path, "no such parameter"))
    }

    fn set(&self, path: &str, value: &str) -> Result<()> {
        // Phase 1: validate and snapshot under the read lock
        let (old, callbacks, hooks, version) = {
            let entries = self.read();
            let entry = entries.get(path).ok_or_else(|| param_err(path, "no such parameter"))?;
            (entry.check)(value).map_err(|e| param_err(path, e))?;
            (entry.value.clone(), entry.callbacks.clone(), entry.hooks.clone(), entry.version)
        };
        if old == value {
            return Ok(());
        }

        // Phase 2: callbacks, no lock held
        for cb in &callbacks {
            cb(&old, value).map_err(|e| param_err(path, format!("rejected: {e}")))?;
        }

        // Phase 3: commit
        {
            let mut entries = self.write();
            let entry = entries.get_mut(path).ok_or_else(|| param_err(path, "no such parameter"))?;
            if entry.version != version {
                debug!("{path}: changed concurrently, last write wins");
            }
            entry.value = value.to_string();
            entry.version += 1;
        }

        // Phase 4: commit hooks, no lock held
        for hook in &hooks {
            hook(value);
        }
        Ok(())
    }

    fn describe(&self) -> Vec<ParamInfo> {
        self.read()
            .iter()
            .map(|(k, e)| ParamInfo {
                path: k.clone(),
                description: e.description.clone(),
                default: e.default.clone(),
                value: e.value.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn typed_parameters_validate_ranges() {
        let reg = ParameterRegistry::new();
        reg.register("post.cthresh", "Threshold in percent", 20.0f32, Some((0.0, 100.0)))
            .unwrap();
        assert_eq!(reg.get_as::<f32>("post.cthresh").unwrap(), 20.0);
        reg.set("post.cthresh", "35.5").unwrap();
        assert_eq!(reg.get("post.cthresh").unwrap(), "35.5");
        assert!(matches!(reg.set("post.cthresh", "150"), Err(Error::Param { .. })));
        assert!(reg.set("post.cthresh", "abc").is_err());
        assert!(reg.set("post.missing", "1").is_err());
        assert!(reg.register("post.cthresh", "again", 1.0f32, None).is_err());
    }

    #[test]
    fn callbacks_can_reject_and_reenter() {
        let reg = Arc::new(ParameterRegistry::new());
        reg.register("a", "first", 1u32, None).unwrap();
        reg.register("b", "mirror of a", 1u32, None).unwrap();
        reg.register_choice("mode", "run mode", "fast", &["fast", "slow"]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (r, c) = (Arc::downgrade(&reg), calls.clone());
        reg.on_change(
            "a",
            Arc::new(move |_old: &str, new: &str| -> std::result::Result<(), String> {
                c.fetch_add(1, Ordering::SeqCst);
                if new == "13" {
                    return Err("unlucky".into());
                }
                // Setting another parameter from a callback must not deadlock
                match r.upgrade() {
                    Some(reg) => reg.set("b", new).map_err(|e| e.to_string()),
                    None => Ok(()),
                }
            }),
        )
        .unwrap();

        reg.set("a", "5").unwrap();
        assert_eq!(reg.get("b").unwrap(), "5");
        assert!(reg.set("a", "13").is_err());
        assert_eq!(reg.get("a").unwrap(), "5");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(reg.set("mode", "medium").is_err());
        reg.reset().unwrap();
        assert_eq!(reg.list(), vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "1".to_string()),
            ("mode".to_string(), "fast".to_string()),
        ]);
        assert_eq!(reg.describe()[2].description, "run mode");
    }

    #[test]
    fn hooks_only_see_committed_values() {
        let reg = ParameterRegistry::new();
        reg.register("level", "level", 1u32, None).unwrap();

        let seen = Arc::new(RwLock::new(Vec::<String>::new()));
        let s = seen.clone();
        reg.on_commit("level", Arc::new(move |v: &str| s.write().unwrap().push(v.to_string())))
            .unwrap();
        reg.on_change("level", Arc::new(|_old: &str, _new: &str| -> std::result::Result<(), String> { Ok(()) })).unwrap();
        // A later callback vetoes after an earlier one accepted
        reg.on_change(
            "level",
            Arc::new(|_old: &str, new: &str| -> std::result::Result<(), String> {
                if new == "7" {
                    return Err("no".into());
                }
                Ok(())
            }),
        )
        .unwrap();

        reg.set("level", "3").unwrap();
        assert!(reg.set("level", "7").is_err());
        reg.set("level", "3").unwrap();
        assert_eq!(reg.get("level").unwrap(), "3");
        assert_eq!(*seen.read().unwrap(), vec!["3".to_string()]);

        reg.reset().unwrap();
        assert_eq!(*seen.read().unwrap(), vec!["3".to_string(), "1".to_string()]);
    }
}
