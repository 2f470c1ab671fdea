pub mod musig;
pub mod script;
pub mod tree;

pub use musig::SigningSession;
pub use tree::{Leaf, SwapTree, TreeDescriptor};
