pub mod backoff;
pub mod budget;
pub mod cancel;
pub mod event_bus;
pub mod generation;
pub mod metrics;
pub mod work_queue;

pub use backoff::*;
pub use budget::*;
pub use cancel::*;
pub use event_bus::*;
pub use generation::*;
pub use work_queue::*;
