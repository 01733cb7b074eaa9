mod lost_found;
mod passes;

pub use self::lost_found::*;
pub use self::passes::*;
