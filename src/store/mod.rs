//! Append-only entry containers holding named chunked arrays and scalars.

pub mod container;

pub use container::{
    ArrayIndex, ArrayMeta, ChunkRef, ContainerIndex, ContainerReader, ContainerWriter,
};
