//! Layered memory: documents, transcripts, compaction and procedure learning.

pub mod compactor;
pub mod context;
pub mod extractor;
pub mod global;
pub mod procedures;
pub mod session;
pub mod store;

pub use compactor::{Compaction, Compactor};
pub use context::{ContextAssembler, ContextRequest};
pub use extractor::ProcedureExtractor;
pub use global::GlobalMemory;
pub use procedures::{Procedure, ProcedureStatus};
pub use session::{Session, Turn, TurnRole};
pub use store::{DocumentKind, DocumentStore, FileStore, Scope};
