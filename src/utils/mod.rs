mod placeholders;

pub use placeholders::{exact_placeholder, substitute};
