//! `chatio`: async line-oriented transport primitives.
//!
//! Chat clients are a zoo: netcat sends LF, telnet tends to send CRLF but
//! can also send CR-NUL, and some terminals emit a bare CR. The
//! [`line::LineReader`] here accepts all of them and hands back lines with
//! the terminator already stripped.

pub mod line;

pub use line::LineReader;
