//! Process-wide catalogue of baskets

mod catalog;
mod stats;
mod token;

use std::sync::LazyLock;

use regex::Regex;

pub use catalog::Registry;
pub use stats::{BasketInfo, BasketsStats};
pub use token::generate_token;

use crate::{BasketsError, Result};

/// Names that collide with system paths of the routing layer
pub const RESERVED_NAMES: [&str; 3] = ["api", "baskets", "web"];

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-.]{1,250}$").unwrap_or_else(|_| unreachable!()));

/// Check a basket name against the reserved names and the naming pattern
///
/// # Errors
///
/// Returns `ReservedName` or `InvalidName`
pub fn validate_name(name: &str) -> Result<()> {
    if RESERVED_NAMES.contains(&name) {
        return Err(BasketsError::ReservedName(name.to_string()));
    }

    if !NAME_PATTERN.is_match(name) {
        return Err(BasketsError::InvalidName(format!(
            "{name}: basket name does not match pattern: {}",
            NAME_PATTERN.as_str()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["orders", "a", "my-basket_1.0", "x".repeat(250).as_str()] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "a/b", "with space", "ünïcode", "q?x", "x".repeat(251).as_str()] {
            assert!(
                matches!(validate_name(name), Err(BasketsError::InvalidName(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn test_reserved_names() {
        for name in RESERVED_NAMES {
            assert!(matches!(
                validate_name(name),
                Err(BasketsError::ReservedName(_))
            ));
        }
        assert!(validate_name("apis").is_ok());
    }
}
