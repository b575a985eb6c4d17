//! Socket side of the solver server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   request  (per submission)  ┌─────────────────────┐
//! │  orchestrator   │ ───────────────────────────► │   dlx --server      │
//! │ (SolverServer-  │   solution (long-lived)      │ (local or container)│
//! │    Session)     │ ◄─────────────────────────── │                     │
//! └─────────────────┘        DLXS frames           └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Solutions come back as one DLXS frame per submission, all integers
//! big-endian:
//!
//! ```text
//! "DLXS" | version u16 | flags u16 | column_count u32
//! ( solution_id u32 | entry_count u16 | entry u32 * entry_count )*
//! 0u32 | 0u16                                       <- terminator row
//! ```

mod connect;
mod framing;
mod session;

pub use connect::ConnectionEstablisher;
pub use framing::{
    read_frame, DlxsFrame, FrameHeader, SolutionRow, DLXS_MAGIC, DLXS_VERSION, ENTRY_SIZE,
    HEADER_SIZE, ROW_HEADER_SIZE,
};
pub use session::{server_spec, stop_container, SolverServerSession};
