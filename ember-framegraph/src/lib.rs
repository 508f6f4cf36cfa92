//! Declarative frame graph over the rendering backend.
//!
//! Passes declare the resources they produce and consume; the graph
//! derives execution order from those declarations, creates transient
//! resources and emits the barriers each pass needs before recording
//! it. See [`FrameGraph`].

pub mod graph;
pub mod resource;
pub mod schedule;

pub use graph::{Builder, FrameGraph, GraphError, PassContext};
pub use resource::{
    ResourceAccess, ResourceDescriptor, ResourceHandle, buffer_access_flags, texture_layout_access,
};
pub use schedule::schedule;
