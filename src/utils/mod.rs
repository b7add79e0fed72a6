pub mod truncate;

pub use truncate::{truncate_plain, truncate_text};
