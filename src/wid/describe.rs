use std::sync::LazyLock;

use regex::Regex;

/// 4-digit hex attribute handle, with or without a `0x` prefix.
static ATTRIBUTE_HANDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:0[xX])?([0-9A-Fa-f]{4})").expect("handle pattern compiles"));

/// Extracts the attribute handle a prompt refers to.
///
/// A deliberately narrow concession to the tester's free-text prompt
/// format: the handful of GATT-flavoured prompts embed the handle as
/// 4 hex digits, e.g. "... characteristic with handle 0x00B1 ...".
pub(crate) fn attribute_handle(description: &str) -> Option<u16> {
    let captures = ATTRIBUTE_HANDLE.captures(description)?;
    u16::from_str_radix(&captures[1], 16).ok()
}
