use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Sigil every room name carries once normalized.
pub const ROOM_SIGIL: char = '#';

/// Normalized room identifier: lowercase and always prefixed with [`ROOM_SIGIL`].
///
/// Construct through [`RoomName::parse`]; equality is exact string match on the
/// normalized form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
    /// Trims whitespace, lowercases and prepends the sigil when missing.
    ///
    /// Returns `None` for empty input, a bare sigil, or a name whose body
    /// carries whitespace, control characters, `,` or a second sigil. Those
    /// would split or multiply the protocol line the name is written into.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let login = trimmed.strip_prefix(ROOM_SIGIL).unwrap_or(trimmed);
        if login.is_empty() || !login.chars().all(is_name_char) {
            return None;
        }
        let mut name = String::with_capacity(login.len() + 1);
        name.push(ROOM_SIGIL);
        name.push_str(&login.to_ascii_lowercase());
        Some(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Room name without the sigil.
    pub fn login(&self) -> &str {
        &self.0[ROOM_SIGIL.len_utf8()..]
    }
}

fn is_name_char(ch: char) -> bool {
    !(ch.is_whitespace() || ch.is_control() || ch == ',' || ch == ROOM_SIGIL)
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RoomName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RoomName::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid room name: {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_whitespace_and_sigil() {
        let name = RoomName::parse("  CoolStreamer \t").expect("valid");
        assert_eq!(name.as_str(), "#coolstreamer");
        assert_eq!(name.login(), "coolstreamer");

        let already = RoomName::parse("#Bob").expect("valid");
        assert_eq!(already.as_str(), "#bob");
        assert_eq!(already, RoomName::parse("bob").expect("valid"));
    }

    #[test]
    fn rejects_empty_and_bare_sigil() {
        assert!(RoomName::parse("").is_none());
        assert!(RoomName::parse("   ").is_none());
        assert!(RoomName::parse("#").is_none());
        assert!(RoomName::parse(" # ").is_none());
    }

    #[test]
    fn rejects_names_that_would_break_the_command_line() {
        for raw in [
            "evil\r\nPRIVMSG #victim :spam",
            "x\nPART #other",
            "two words",
            "a,#b,#c,#d",
            "#a#b",
            "tab\there",
            "nul\0byte",
        ] {
            assert!(RoomName::parse(raw).is_none(), "{raw:?}");
        }
        assert_eq!(
            RoomName::parse("under_score-123").expect("valid").as_str(),
            "#under_score-123"
        );
    }

    #[test]
    fn deserialize_normalizes() {
        let names: Vec<RoomName> = serde_json::from_str(r##"["#Alpha", "beta"]"##).expect("json");
        assert_eq!(names[0].as_str(), "#alpha");
        assert_eq!(names[1].as_str(), "#beta");
        assert!(serde_json::from_str::<RoomName>(r##""#""##).is_err());
        assert!(serde_json::from_str::<RoomName>(r##""a b""##).is_err());
    }
}
