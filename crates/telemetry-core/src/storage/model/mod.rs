mod sample;

pub use sample::{SENTINEL, Sample};
