//! Chunked upload coordinator
//!
//! Ingests multi-gigabyte archives as fixed-size byte-range chunks that may
//! arrive in any order, over any number of connections, across process
//! restarts.
//!
//! Protocol flow:
//! 1. Client declares filename, total size, and chunk count; the server
//!    preallocates the blob and answers with a session id plus the indices
//!    already received (the resume manifest)
//! 2. Chunks stream directly to `index × chunk_size` inside the blob; each
//!    accepted chunk flips its ledger row to SUCCESS
//! 3. The last SUCCESS triggers finalization: exclusive claim, size + SHA-256
//!    + archive-structure verification, terminal COMPLETED or FAILED
//! 4. Recovery sweeps at startup and on a timer drive anything interrupted or
//!    abandoned to a well-defined outcome

pub mod finalize;
pub mod ingest;
pub mod recovery;
pub mod session;
pub mod types;

pub use finalize::Finalizer;
pub use ingest::ChunkIngestor;
pub use recovery::{RecoveryReport, RecoveryService};
pub use session::SessionManager;
pub use types::*;
