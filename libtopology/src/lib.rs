pub mod keys;
pub mod transformer;
pub mod writer;

pub use transformer::{StructureParseError, transform};
pub use writer::{ResourceWriteClient, RetryingWriter, WriterPolicy};
