pub mod convert;
pub mod format;
pub mod util;
