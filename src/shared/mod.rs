pub mod clock;
pub mod errors;
pub mod fs_atomic;
pub mod ids;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::ErrorKind;
pub use ids::{IdGenerator, ProfileId, RandomIds, SequentialIds, StepId};
pub use logging::{LogLevel, Logger};
