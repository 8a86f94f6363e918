pub mod error;
pub mod path;
pub mod rules;
pub mod tree;
pub mod tree_binder;
pub mod unmarshal;
pub mod xml;

pub use error::BindError;
pub use path::Path;
pub use rules::{BeginFn, BinderState, EndFn, RuleBinder};
pub use tree::{Kind, Node, NodeRef};
pub use tree_binder::{BindKind, BindingDesc, BindingSet, ParseRule, TreeBinder, TreeState};
pub use unmarshal::Unmarshaller;
pub use xml::{ElementHandler, XmlDriver};
