//! Property module - capability metadata advertised on the bus.
//!
//! Provides:
//! - [`WorkerProperties`] - fixed schema (`RemoteContent`, `Features`)
//! - [`PropertyValue`] - variant used by Get/Set/GetAll
//! - [`PropertyStore`] - shared store with change notifications

mod store;
mod value;

pub use store::{
    Features, PropertiesChanged, PropertyName, PropertyStore, WorkerProperties,
    DEFAULT_FEATURES_VERSION,
};
pub use value::PropertyValue;
