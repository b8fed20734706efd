pub mod backends;
pub mod encoder;
pub mod image;
