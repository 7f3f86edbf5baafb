//! Hand-rolled selector engines for the non-CSS rule kinds.

pub mod jsonpath;
pub mod xpath;

pub use jsonpath::JsonPath;
pub use xpath::{XPathExpr, XPathValue};
