// SPDX-License-Identifier: GPL-3.0-only

/// Reads a boolean switch from the environment.
///
/// Unset variables are `None`; any value not spelling "true" is `false`.
pub fn bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|value| is_true(&value))
}

fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}
