pub mod crypto;
pub mod ctx;
pub mod error;
pub mod queue;
pub mod sync;

pub use ctx::{Ctx, Scope};
pub use error::{Error, Result, ResultExt, VerifyError};
pub use queue::IndexQueue;
pub use sync::Guarded;
