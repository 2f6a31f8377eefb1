//! Middlewares that ship with the engine. Persistence lives in `persist`.

pub mod error;
pub mod thunk;

pub use error::{ErrorMiddleware, TracingReporter};
pub use thunk::ThunkMiddleware;
