//! Find requests and their results.

mod identifiers;
mod request;
mod response;

pub use identifiers::OrthancIdentifiers;
pub use request::{ChildrenSpecification, FindRequest, ParentSpecification};
pub use response::{FindResource, FindResponse};
