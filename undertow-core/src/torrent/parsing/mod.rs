//! Content description and magnet link parsing.
//!
//! Description decoding uses bencode-rs, magnet links use magnet-url.
//! Re-encoding goes through [`BencodeWriter`] so the info dictionary bytes
//! survive untouched and the identity is preserved.

pub mod bencode;
pub mod encode;
pub mod magnet;

pub use bencode::BencodeParser;
pub use encode::BencodeWriter;
pub use magnet::{MagnetLink, MagnetParser};
