pub mod document;
pub mod identity;
pub mod path;

pub use document::{Document, Fields, JobStatus, WriteStamp};
pub use identity::Actor;
pub use path::{CollectionPath, JobChild, RootCollection, Scope, SequenceSpec};
