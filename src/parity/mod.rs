//! PAR2 parity handling
//!
//! Verification and repair are delegated to an external `par2` binary; the
//! tool's stdout is parsed line-by-line into structured progress and a final
//! report. A no-op handler stands in when no binary is available, and a pure
//! Rust packet parser extracts the real filenames PAR2 carries for
//! obfuscated releases.

mod cli;
mod metadata;
mod noop;
mod parser;
mod traits;

pub use cli::CliParityHandler;
pub use metadata::{Par2FileEntry, compute_16k_md5, parse_par2_file_entries};
pub use noop::NoOpParityHandler;
pub use parser::{PAR2_PATTERN_VERSION, ProgressLine, parse_line};
pub use traits::{
    ParityCapabilities, ParityHandler, ProgressSink, RepairOutcome, RepairReport, VerifyReport,
};
