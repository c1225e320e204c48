pub mod build;
pub mod builder;
pub mod encrypt;
pub mod header;
pub mod mime;
pub mod section;
