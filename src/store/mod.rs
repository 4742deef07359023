pub mod object_store;

pub use object_store::{MANIFEST_KEY, ObjectStore};
