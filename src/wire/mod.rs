pub mod codec;
pub mod envelope;
