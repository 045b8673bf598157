//! Streaming, path-addressed XML reader and nested XML writer (spec §4.B).

mod reader;
mod writer;

pub use reader::PathReader;
pub use writer::NestedWriter;
