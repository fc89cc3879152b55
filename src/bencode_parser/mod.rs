pub mod encoder;
pub mod errors;
pub mod parser;
