pub mod dom;

pub use dom::{AttrMatch, Document, MediaState, Node, NodeId, NodeKind, NodeState, Selector};
