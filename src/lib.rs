pub mod archive;
pub mod assembler;
pub mod error;
pub mod extract;
pub mod image;
pub mod notifier;
pub mod registry;
pub mod tree;

// Re-exports for easy access
pub use error::{AuthError, Error, Result};
pub use extract::{ExtractOptions, MatchMode};
pub use image::{Image, Layer, LayerNode};
pub use notifier::Notifier;
pub use registry::{ImageName, RegistryClient, RegistryConfig};
pub use tree::{FileInfo, FileNode, FileTree, NodeId};
