// Shared building blocks for the formbridge daemon and launcher:
// - Message codec (host wire format <-> field map)
// - Subject line derivation
// - Settings loading with modification-time caching
// - Installation layout
// - Shared error type

pub mod codec;
pub use codec::{parse_message, MessageDraft, ParsedMessage};

pub mod subject;
pub use subject::{subject_from_message, SubjectTemplate};

pub mod settings;
pub use settings::{Settings, SettingsLoader};

pub mod layout;
pub use layout::Layout;

pub mod errors;
pub use errors::*;
