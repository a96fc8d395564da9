//! Semantic layer - turning renderer output into frame events

pub mod lines;
pub mod parser;

pub use lines::LineAssembler;
pub use parser::{classify, OutputEvent, OutputParser};
