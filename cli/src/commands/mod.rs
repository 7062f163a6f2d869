pub mod call;
pub mod doc;
pub mod list;
