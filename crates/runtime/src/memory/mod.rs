//! The memory substrate: the append-only episodic log and the
//! embedding-backed vector store.

pub mod episodic;
pub mod vector;

pub use episodic::{ArchiveReport, Episode, EpisodicStore};
pub use vector::{IntegrityReport, SearchHit, VectorStore};
