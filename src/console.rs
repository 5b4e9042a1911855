//! Colored diagnostics. Task output owns stdout; everything here goes to
//! stderr so the two streams never mix.

use console::style;

/// Print an error message in red to stderr.
pub fn print_error(message: impl AsRef<str>) {
    eprintln!("{}", style(message.as_ref()).red());
}

/// Print a warning message in yellow to stderr.
pub fn print_warning(message: impl AsRef<str>) {
    eprintln!("{}", style(message.as_ref()).yellow());
}
