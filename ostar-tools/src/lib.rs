pub mod compression;
pub mod fs;
pub mod io;
pub mod percent_encoding;
pub mod sync;
pub mod time;
pub mod xattr;
