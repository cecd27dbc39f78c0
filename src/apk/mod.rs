pub mod manifest;
pub mod zip;
