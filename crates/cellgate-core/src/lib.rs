//! cellgate-core: Shared protocol library for the cellgate proxy.
//!
//! Provides the WebSocket frame codec, the kernel message envelope,
//! the notebook document model, and the notebook-lookup trait.

pub mod error;
pub mod frame;
pub mod message;
pub mod notebook;

// Re-export commonly used items at crate root.
pub use error::{GateError, GateResult};
pub use frame::{decode, encode, Frame, FrameBuffer, Opcode};
pub use message::{parse_cell_index, KernelMessage, MessageHeader, EXECUTE_REQUEST};
pub use notebook::{Notebook, NotebookStore};
