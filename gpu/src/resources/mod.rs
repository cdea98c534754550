//! GPU resources.
//!
//! Textures and buffers are reference counted. Each carries its hazard state
//! behind a mutex; the state is only mutated through a
//! [`Recording`](crate::Recording), so it always describes the last use
//! recorded into some command. Dropping the last handle defers destruction of
//! the native objects until that command has completed.

mod buffer;
mod deferred;
mod texture;

pub use buffer::Buffer;
pub use deferred::{DeferredDestructor, DeferredResource};
pub use texture::Texture;
