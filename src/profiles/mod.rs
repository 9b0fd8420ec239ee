pub mod bindings;
pub mod error;
pub mod store;

pub use bindings::SessionBindings;
pub use error::ProfileError;
pub use store::{Profile, ProfileStore};
