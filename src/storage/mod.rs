//! Storage substrate: blob/document store, the instance index and fault injection.

pub mod error;
pub mod instance_store;
pub mod object_store;
pub mod simulated_store;

pub use error::StoreError;
pub use instance_store::{
    hierarchical_blob_key, legacy_blob_key, metadata_key, read_instance_blob, DerivedProperties,
    InMemoryDicomStore, InstanceIdentifier, InstanceWatermarkStore,
};
pub use object_store::{
    get_json, put_json_atomic, InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore,
};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
