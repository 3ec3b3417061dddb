//! NDJSON envelope spoken with agent processes.
//!
//! Agents write one JSON object per stdout line and read one JSON object per
//! stdin line. Inbound lines are parsed with a tolerant reader: unknown
//! fields are ignored and unknown types are preserved as
//! [`AgentEvent::Unknown`].

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
