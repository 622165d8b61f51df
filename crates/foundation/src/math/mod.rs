pub mod affine;
pub mod frustum;
pub mod ordering;
pub mod vec;

pub use affine::*;
pub use frustum::*;
pub use ordering::*;
