pub mod capability;
pub mod errors;
pub mod events;
pub mod ids;
pub mod metrics;
pub mod status;

pub use errors::ApiError;
pub use events::{ControlEvent, Envelope, EnvelopeKind, ENVELOPE_VERSION};
pub use ids::validate_id;
