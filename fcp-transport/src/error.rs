pub use fcp_core::error::{FcError, FcResult};
