//! Worker identity and the bus names derived from it.
//!
//! A worker is addressed on the bus by a well-known name and an object
//! path, both computed from a namespace and the worker name:
//!
//! ```text
//! bus name:    com.redhat.Yggdrasil1.Worker1.echo
//! object path: /com/redhat/Yggdrasil1/Worker1/echo
//! ```
//!
//! # Example
//!
//! ```
//! use ygg_worker::WorkerIdentity;
//!
//! let id = WorkerIdentity::new("echo").unwrap();
//! assert_eq!(id.bus_name(), "com.redhat.Yggdrasil1.Worker1.echo");
//! assert_eq!(id.object_path(), "/com/redhat/Yggdrasil1/Worker1/echo");
//! ```

use std::fmt;

use crate::error::{Result, WorkerError};

/// Default bus namespace used by the dispatcher daemon.
pub const DEFAULT_NAMESPACE: &str = "com.redhat.Yggdrasil1";

/// Interface segment under which workers are published.
const WORKER_SEGMENT: &str = "Worker1";

/// Interface segment of the dispatcher.
const DISPATCHER_SEGMENT: &str = "Dispatcher1";

/// Immutable identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    namespace: String,
    name: String,
}

impl WorkerIdentity {
    /// Create an identity in the default namespace.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_namespace(DEFAULT_NAMESPACE, name)
    }

    /// Create an identity in a custom namespace.
    pub fn with_namespace(namespace: &str, name: &str) -> Result<Self> {
        validate_element(name)
            .map_err(|why| WorkerError::InvalidIdentity(format!("name {:?}: {}", name, why)))?;

        if namespace.is_empty() {
            return Err(WorkerError::InvalidIdentity("namespace is empty".into()));
        }
        for element in namespace.split('.') {
            validate_element(element).map_err(|why| {
                WorkerError::InvalidIdentity(format!("namespace {:?}: {}", namespace, why))
            })?;
        }

        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// The worker name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bus namespace.
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Well-known bus name claimed by this worker.
    pub fn bus_name(&self) -> String {
        format!("{}.{}.{}", self.namespace, WORKER_SEGMENT, self.name)
    }

    /// Object path the worker interface is exported at.
    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/{}",
            namespace_path(&self.namespace),
            WORKER_SEGMENT,
            self.name
        )
    }

    /// Interface name carrying Dispatch, Cancel, Event and the properties.
    pub fn interface_name(&self) -> String {
        format!("{}.{}", self.namespace, WORKER_SEGMENT)
    }

    /// Bus name of the dispatcher daemon.
    pub fn dispatcher_bus_name(&self) -> String {
        format!("{}.{}", self.namespace, DISPATCHER_SEGMENT)
    }

    /// Interface name of the dispatcher daemon.
    pub fn dispatcher_interface(&self) -> String {
        self.dispatcher_bus_name()
    }

    /// Object path of the dispatcher daemon.
    pub fn dispatcher_object_path(&self) -> String {
        format!("{}/{}", namespace_path(&self.namespace), DISPATCHER_SEGMENT)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bus_name())
    }
}

fn namespace_path(namespace: &str) -> String {
    format!("/{}", namespace.replace('.', "/"))
}

/// An element must work both in a bus name and in an object path.
fn validate_element(element: &str) -> std::result::Result<(), &'static str> {
    let mut chars = element.chars();
    match chars.next() {
        None => return Err("empty element"),
        Some(c) if c.is_ascii_digit() => return Err("element starts with a digit"),
        _ => {}
    }
    if !element
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("only ASCII letters, digits and '_' are allowed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_namespace_derivation() {
        let id = WorkerIdentity::new("echo").unwrap();
        assert_eq!(id.name(), "echo");
        assert_eq!(id.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(id.bus_name(), "com.redhat.Yggdrasil1.Worker1.echo");
        assert_eq!(id.object_path(), "/com/redhat/Yggdrasil1/Worker1/echo");
        assert_eq!(id.interface_name(), "com.redhat.Yggdrasil1.Worker1");
    }

    #[test]
    fn test_dispatcher_names() {
        let id = WorkerIdentity::new("echo").unwrap();
        assert_eq!(id.dispatcher_bus_name(), "com.redhat.Yggdrasil1.Dispatcher1");
        assert_eq!(id.dispatcher_interface(), "com.redhat.Yggdrasil1.Dispatcher1");
        assert_eq!(id.dispatcher_object_path(), "/com/redhat/Yggdrasil1/Dispatcher1");
    }

    #[test]
    fn test_custom_namespace() {
        let id = WorkerIdentity::with_namespace("org.example.Bus2", "pkg_mgr").unwrap();
        assert_eq!(id.bus_name(), "org.example.Bus2.Worker1.pkg_mgr");
        assert_eq!(id.object_path(), "/org/example/Bus2/Worker1/pkg_mgr");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        for name in ["echo", "a", "worker_2", "Package_Manager"] {
            let first = WorkerIdentity::new(name).unwrap();
            let second = WorkerIdentity::new(name).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.bus_name(), second.bus_name());
            assert_eq!(first.object_path(), first.object_path());
            assert_eq!(first.bus_name(), first.bus_name());
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        for name in ["", "9lives", "has-dash", "dotted.name", "slash/name", "spa ce"] {
            let result = WorkerIdentity::new(name);
            assert!(
                matches!(result, Err(WorkerError::InvalidIdentity(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_rejects_invalid_namespace() {
        assert!(WorkerIdentity::with_namespace("", "echo").is_err());
        assert!(WorkerIdentity::with_namespace("com..redhat", "echo").is_err());
        assert!(WorkerIdentity::with_namespace("com.1redhat", "echo").is_err());
    }

    #[test]
    fn test_display_is_bus_name() {
        let id = WorkerIdentity::new("echo").unwrap();
        assert_eq!(id.to_string(), id.bus_name());
    }
}
