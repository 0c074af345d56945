//! Typed identifier definitions.

use crate::{define_id, define_name, IdError};

/// Maximum length of a caller-supplied name.
pub const MAX_NAME_LEN: usize = 255;

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(InstanceGuid, "ig");

// =============================================================================
// Names
// =============================================================================

define_name!(ProcessGuid, "process guid");
define_name!(CellId, "cell id");
define_name!(Domain, "domain");

#[doc(hidden)]
pub fn validate_name(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.chars().count() > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            kind,
            max: MAX_NAME_LEN,
        });
    }
    if let Some(ch) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdError::InvalidCharacter { kind, ch });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
