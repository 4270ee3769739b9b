//! Property store serving capability metadata to the bus and local code.
//!
//! The schema is closed: only [`PropertyName`] values exist. Reads of any
//! other name resolve to `None`; writes of any other name are rejected.
//!
//! Access is serialized through a `RwLock` because Get/Set arrive from bus
//! calls and from worker code concurrently. Change notifications are
//! broadcast to subscribers (the signal task forwards them to the bus).
//!
//! `set` does not notify on its own. Callers pick between `set` followed
//! by an explicit `notify`, or `set_and_notify`.
//!
//! `DispatchedAt` stamps are not broadcast. A burst of dispatches would
//! otherwise push explicit notifications out of the bounded channel. Stamps
//! are coalesced on a `watch` channel instead and announced with the
//! current `Features` value.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use super::PropertyValue;
use crate::error::{Result, WorkerError};

/// Capacity of the change notification channel.
const NOTIFY_CAPACITY: usize = 64;

/// Version advertised in `Features` by default.
pub const DEFAULT_FEATURES_VERSION: &str = "1";

const DISPATCHED_AT_KEY: &str = "DispatchedAt";
const VERSION_KEY: &str = "Version";

/// Recognized capability properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyName {
    RemoteContent,
    Features,
}

impl PropertyName {
    pub const ALL: [PropertyName; 2] = [PropertyName::RemoteContent, PropertyName::Features];

    /// Wire name of the property.
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyName::RemoteContent => "RemoteContent",
            PropertyName::Features => "Features",
        }
    }
}

impl FromStr for PropertyName {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        PropertyName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| WorkerError::UnknownProperty(s.to_string()))
    }
}

/// The nested `Features` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    /// RFC 3339 time of the last accepted dispatch, empty before the first.
    pub dispatched_at: String,
    pub version: String,
    /// Additional worker-defined feature flags.
    pub extra: BTreeMap<String, String>,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            dispatched_at: String::new(),
            version: DEFAULT_FEATURES_VERSION.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl Features {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(DISPATCHED_AT_KEY.to_string(), self.dispatched_at.clone());
        map.insert(VERSION_KEY.to_string(), self.version.clone());
        map
    }

    /// Replace from a wire map. Known keys missing from `map` keep their
    /// current value; extra keys are replaced wholesale.
    fn replace_from(&mut self, mut map: BTreeMap<String, String>) {
        if let Some(at) = map.remove(DISPATCHED_AT_KEY) {
            self.dispatched_at = at;
        }
        if let Some(version) = map.remove(VERSION_KEY) {
            self.version = version;
        }
        self.extra = map;
    }
}

/// Fixed-schema capability metadata of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerProperties {
    pub remote_content: bool,
    pub features: Features,
}

impl WorkerProperties {
    /// Read one property as a wire value.
    pub fn value(&self, name: PropertyName) -> PropertyValue {
        match name {
            PropertyName::RemoteContent => PropertyValue::Bool(self.remote_content),
            PropertyName::Features => PropertyValue::Map(self.features.to_map()),
        }
    }

    /// Write one property from a wire value, checking its type.
    pub fn apply(&mut self, name: PropertyName, value: PropertyValue) -> Result<()> {
        match (name, value) {
            (PropertyName::RemoteContent, PropertyValue::Bool(b)) => {
                self.remote_content = b;
                Ok(())
            }
            (PropertyName::Features, PropertyValue::Map(map)) => {
                self.features.replace_from(map);
                Ok(())
            }
            (PropertyName::RemoteContent, _) => Err(WorkerError::InvalidProperty {
                name: name.as_str().to_string(),
                expected: "boolean",
            }),
            (PropertyName::Features, _) => Err(WorkerError::InvalidProperty {
                name: name.as_str().to_string(),
                expected: "string map",
            }),
        }
    }

    /// All properties keyed by wire name.
    pub fn to_map(&self) -> BTreeMap<String, PropertyValue> {
        PropertyName::ALL
            .into_iter()
            .map(|p| (p.as_str().to_string(), self.value(p)))
            .collect()
    }
}

/// A `PropertiesChanged` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: BTreeMap<String, PropertyValue>,
    pub invalidated: Vec<String>,
}

/// Shared, serialized property store. Cheap to clone.
#[derive(Clone)]
pub struct PropertyStore {
    interface: Arc<str>,
    inner: Arc<RwLock<WorkerProperties>>,
    notify_tx: broadcast::Sender<PropertiesChanged>,
    stamp_tx: Arc<watch::Sender<()>>,
}

impl PropertyStore {
    /// Create a store for the given interface with initial values.
    pub fn new(interface: impl Into<String>, initial: WorkerProperties) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (stamp_tx, _) = watch::channel(());
        Self {
            interface: Arc::from(interface.into()),
            inner: Arc::new(RwLock::new(initial)),
            notify_tx,
            stamp_tx: Arc::new(stamp_tx),
        }
    }

    /// Interface the properties belong to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Get a property. Unknown interface or name resolves to `None`.
    pub fn get(&self, interface: &str, name: &str) -> Option<PropertyValue> {
        if interface != &*self.interface {
            return None;
        }
        let name = name.parse::<PropertyName>().ok()?;
        Some(self.inner.read().value(name))
    }

    /// Snapshot of all properties. Unknown interface yields an empty map.
    pub fn get_all(&self, interface: &str) -> BTreeMap<String, PropertyValue> {
        if interface != &*self.interface {
            return BTreeMap::new();
        }
        self.inner.read().to_map()
    }

    /// Typed snapshot of the current values.
    pub fn snapshot(&self) -> WorkerProperties {
        self.inner.read().clone()
    }

    /// Overwrite a property without notifying subscribers.
    pub fn set(&self, interface: &str, name: &str, value: PropertyValue) -> Result<()> {
        self.check_interface(interface, name)?;
        let name = name.parse::<PropertyName>()?;
        self.inner.write().apply(name, value)
    }

    /// Overwrite a property and broadcast `PropertiesChanged` for it.
    pub fn set_and_notify(&self, interface: &str, name: &str, value: PropertyValue) -> Result<()> {
        self.check_interface(interface, name)?;
        let prop = name.parse::<PropertyName>()?;
        let current = {
            let mut guard = self.inner.write();
            guard.apply(prop, value)?;
            guard.value(prop)
        };
        self.send(self.change([(prop.as_str().to_string(), current)].into_iter().collect()));
        Ok(())
    }

    /// Broadcast the current values of the named properties.
    pub fn notify(&self, interface: &str, names: &[&str]) -> Result<()> {
        let props = names
            .iter()
            .map(|n| {
                self.check_interface(interface, n)?;
                n.parse::<PropertyName>()
            })
            .collect::<Result<Vec<_>>>()?;

        self.send(self.changed_now(&props));
        Ok(())
    }

    /// Record the time of an accepted dispatch in `Features.DispatchedAt`.
    ///
    /// Marks the stamp channel instead of broadcasting; see
    /// [`subscribe_stamps`](Self::subscribe_stamps).
    pub fn stamp_dispatched_at(&self, at: &str) {
        self.inner.write().features.dispatched_at = at.to_string();
        self.stamp_tx.send_replace(());
    }

    /// Subscribe to change notifications from `set_and_notify` and `notify`.
    pub fn subscribe(&self) -> broadcast::Receiver<PropertiesChanged> {
        self.notify_tx.subscribe()
    }

    /// Subscribe to `DispatchedAt` stamps.
    ///
    /// Any number of stamps between two reads collapse into one change.
    /// Announce it with [`changed_now`](Self::changed_now).
    pub fn subscribe_stamps(&self) -> watch::Receiver<()> {
        self.stamp_tx.subscribe()
    }

    /// A `PropertiesChanged` carrying the current value of `names`.
    pub fn changed_now(&self, names: &[PropertyName]) -> PropertiesChanged {
        let changed = {
            let guard = self.inner.read();
            names
                .iter()
                .map(|p| (p.as_str().to_string(), guard.value(*p)))
                .collect()
        };
        self.change(changed)
    }

    fn check_interface(&self, interface: &str, name: &str) -> Result<()> {
        if interface != &*self.interface {
            return Err(WorkerError::UnknownProperty(format!("{}.{}", interface, name)));
        }
        Ok(())
    }

    fn change(&self, changed: BTreeMap<String, PropertyValue>) -> PropertiesChanged {
        PropertiesChanged {
            interface: self.interface.to_string(),
            changed,
            invalidated: Vec::new(),
        }
    }

    fn send(&self, event: PropertiesChanged) {
        // No subscribers is fine
        if self.notify_tx.send(event).is_err() {
            tracing::trace!("PropertiesChanged with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IFACE: &str = "com.redhat.Yggdrasil1.Worker1";

    fn store() -> PropertyStore {
        PropertyStore::new(IFACE, WorkerProperties::default())
    }

    #[test]
    fn test_defaults() {
        let store = store();
        assert_eq!(store.get(IFACE, "RemoteContent"), Some(PropertyValue::Bool(false)));

        let features = store.get(IFACE, "Features").unwrap();
        let map = features.as_map().unwrap();
        assert_eq!(map["Version"], "1");
        assert_eq!(map["DispatchedAt"], "");
    }

    #[test]
    fn test_unknown_property_is_absent() {
        let store = store();
        assert_eq!(store.get(IFACE, "NoSuchThing"), None);
        assert_eq!(store.get("org.example.Other", "RemoteContent"), None);
        assert!(store.get_all("org.example.Other").is_empty());
    }

    #[test]
    fn test_set_then_get() {
        let store = store();
        store.set(IFACE, "RemoteContent", true.into()).unwrap();
        assert_eq!(store.get(IFACE, "RemoteContent"), Some(PropertyValue::Bool(true)));
        assert_eq!(store.get_all(IFACE)["RemoteContent"], PropertyValue::Bool(true));
    }

    #[test]
    fn test_get_all_is_snapshot() {
        let store = store();
        let mut all = store.get_all(IFACE);
        all.insert("RemoteContent".to_string(), PropertyValue::Bool(true));
        all.remove("Features");

        assert_eq!(store.get(IFACE, "RemoteContent"), Some(PropertyValue::Bool(false)));
        assert!(store.get(IFACE, "Features").is_some());
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let store = store();
        let result = store.set(IFACE, "RemoteContent", "yes".into());
        assert!(matches!(
            result,
            Err(WorkerError::InvalidProperty { expected: "boolean", .. })
        ));
        assert_eq!(store.get(IFACE, "RemoteContent"), Some(PropertyValue::Bool(false)));
    }

    #[test]
    fn test_set_rejects_unknown_name_and_interface() {
        let store = store();
        assert!(matches!(
            store.set(IFACE, "Color", "blue".into()),
            Err(WorkerError::UnknownProperty(_))
        ));
        assert!(matches!(
            store.set("org.example.Other", "RemoteContent", true.into()),
            Err(WorkerError::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_set_features_keeps_missing_known_keys() {
        let store = store();
        let mut map = BTreeMap::new();
        map.insert("Arch".to_string(), "x86_64".to_string());
        store.set(IFACE, "Features", map.into()).unwrap();

        let features = store.snapshot().features;
        assert_eq!(features.version, "1");
        assert_eq!(features.extra["Arch"], "x86_64");

        let mut map = BTreeMap::new();
        map.insert("Version".to_string(), "2".to_string());
        store.set(IFACE, "Features", map.into()).unwrap();

        let features = store.snapshot().features;
        assert_eq!(features.version, "2");
        assert!(features.extra.is_empty());
    }

    #[test]
    fn test_plain_set_does_not_notify() {
        let store = store();
        let mut rx = store.subscribe();
        store.set(IFACE, "RemoteContent", true.into()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_and_notify() {
        let store = store();
        let mut rx = store.subscribe();
        store
            .set_and_notify(IFACE, "RemoteContent", true.into())
            .unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.interface, IFACE);
        assert_eq!(change.changed["RemoteContent"], PropertyValue::Bool(true));
        assert!(change.invalidated.is_empty());
    }

    #[test]
    fn test_explicit_notify() {
        let store = store();
        let mut rx = store.subscribe();
        store.set(IFACE, "RemoteContent", true.into()).unwrap();
        store.notify(IFACE, &["RemoteContent", "Features"]).unwrap();

        let change = rx.try_recv().unwrap();
        assert_eq!(change.changed.len(), 2);
        assert_eq!(change.changed["RemoteContent"], PropertyValue::Bool(true));

        assert!(store.notify(IFACE, &["Bogus"]).is_err());
    }

    #[test]
    fn test_stamp_dispatched_at() {
        let store = store();
        let mut stamps = store.subscribe_stamps();
        assert!(!stamps.has_changed().unwrap());

        store.stamp_dispatched_at("2024-01-01T00:00:00Z");
        store.stamp_dispatched_at("2024-01-01T00:00:01Z");

        assert_eq!(store.snapshot().features.dispatched_at, "2024-01-01T00:00:01Z");
        assert!(stamps.has_changed().unwrap());
        stamps.mark_unchanged();
        assert!(!stamps.has_changed().unwrap());

        let change = store.changed_now(&[PropertyName::Features]);
        assert_eq!(change.interface, IFACE);
        assert_eq!(
            change.changed["Features"].as_map().unwrap()["DispatchedAt"],
            "2024-01-01T00:00:01Z"
        );
    }

    #[test]
    fn test_stamp_burst_keeps_explicit_notifications() {
        let store = store();
        let mut rx = store.subscribe();

        store
            .set_and_notify(IFACE, "RemoteContent", true.into())
            .unwrap();
        for i in 0..NOTIFY_CAPACITY * 2 {
            store.stamp_dispatched_at(&format!("stamp-{}", i));
        }

        let change = rx.try_recv().unwrap();
        assert_eq!(change.changed["RemoteContent"], PropertyValue::Bool(true));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let a = store();
        let b = a.clone();
        a.set(IFACE, "RemoteContent", true.into()).unwrap();
        assert_eq!(b.get(IFACE, "RemoteContent"), Some(PropertyValue::Bool(true)));
    }
}
