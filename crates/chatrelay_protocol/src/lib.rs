#![forbid(unsafe_code)]

pub mod line;
pub mod translate;

pub use line::{LineError, ParsedMessage, escape_tag_value, parse_line, unescape_tag_value};
pub use translate::translate;
