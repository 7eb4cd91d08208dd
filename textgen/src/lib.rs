pub mod adapter;
pub mod factory;
pub mod stopper;
pub mod stream;
pub mod tokenizer;
pub mod tools;
pub mod types;

// Re-export commonly used types
pub use types::*;

// Re-export the adapter surface
pub use adapter::{DebugAdapter, GenerationAdapter, LocalAdapter, RemoteAdapter};

// Re-export factory functionality
pub use factory::{detect_backend_kind, AdapterFactory, BackendKind};

// Re-export stop handling
pub use stopper::{canonical_stop_ids, KeywordStopper, MaxTokensStopper, Stopper};
pub use stream::{truncate_at_stop, StopStream, TokenStream};

pub use tokenizer::Tokenizer;
