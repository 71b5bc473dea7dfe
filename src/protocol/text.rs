//! Chat text hygiene
//!
//! Game chat embeds markup tags (`<col=ff0000>`, `<img=2>`) and uses
//! non-breaking spaces inside display names. Everything that keys a
//! per-sender table goes through [`canonical_name`] so the same player is
//! never tracked under two spellings.

/// Marker that only staff accounts may carry at the start of a name
pub const RESERVED_NAME_PREFIX: &str = "mod ";

/// Badge prepended to world broadcast senders
pub const BROADCAST_BADGE: &str = "<img=19> ";

/// Account icons that inbound messages may display
const ALLOWED_ACCOUNT_ICONS: [&str; 3] = ["<img=2>", "<img=10>", "<img=3>"];

/// Strip `<...>` markup tags
///
/// An unterminated `<` is kept verbatim, matching how the game renders it.
pub fn remove_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => rest = &rest[open + close + 1..],
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Canonical form of a display name
///
/// Tags are removed, NBSP/underscore/hyphen become spaces, runs of
/// whitespace collapse to one space and the result is trimmed.
pub fn canonical_name(raw: &str) -> String {
    let untagged = remove_tags(raw);
    let mut out = String::with_capacity(untagged.len());
    let mut pending_space = false;

    for c in untagged.chars() {
        let c = match c {
            '\u{00A0}' | '_' | '-' => ' ',
            other => other,
        };
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}

/// Names starting with the staff marker are never relayed
pub fn is_reserved_name(name: &str) -> bool {
    name.to_lowercase().starts_with(RESERVED_NAME_PREFIX)
}

/// Keep an account icon only if it is one clients are allowed to claim
pub fn valid_account_icon(symbol: &str) -> &str {
    if ALLOWED_ACCOUNT_ICONS.contains(&symbol) {
        symbol
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("hello", "hello" ; "no tags")]
    #[test_case("<col=ff0000>red</col>", "red" ; "colour tags")]
    #[test_case("<img=2>Iron", "Iron" ; "icon prefix")]
    #[test_case("a < b", "a < b" ; "unterminated open")]
    #[test_case("", "" ; "empty")]
    fn test_remove_tags(input: &str, expected: &str) {
        assert_eq!(remove_tags(input), expected);
    }

    #[test_case("Zezima", "Zezima" ; "plain")]
    #[test_case("Big\u{00A0}Bob", "Big Bob" ; "nbsp")]
    #[test_case("big_bob", "big bob" ; "underscore")]
    #[test_case("  a--b  ", "a b" ; "collapse and trim")]
    #[test_case("<img=2>Iron Man", "Iron Man" ; "tagged")]
    fn test_canonical_name(input: &str, expected: &str) {
        assert_eq!(canonical_name(input), expected);
    }

    #[test]
    fn test_reserved_name_is_case_insensitive() {
        assert!(is_reserved_name("Mod Zed"));
        assert!(is_reserved_name("MOD ash"));
        assert!(!is_reserved_name("Modest"));
        assert!(!is_reserved_name("Zed"));
    }

    #[test]
    fn test_valid_account_icon() {
        assert_eq!(valid_account_icon("<img=2>"), "<img=2>");
        assert_eq!(valid_account_icon("<img=10>"), "<img=10>");
        assert_eq!(valid_account_icon("<img=0>"), "");
        assert_eq!(valid_account_icon("anything"), "");
    }
}
