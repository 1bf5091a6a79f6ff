pub mod catalog;
pub mod invoker;

pub use catalog::{schema_to_parameters, SharedCatalog, ToolCatalog};
pub use invoker::{decode_parameters, InvokeError, ToolInvoker};
