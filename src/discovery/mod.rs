pub mod registry;
pub mod watcher;

pub use registry::{ConsulClient, InstanceQuery, QueryOptions, RegistryClient, StaticRegistry};
pub use watcher::{InstanceWatcher, WatchSettings};
