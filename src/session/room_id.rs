//! Room id derivation. A room id is whatever the user pasted: a bare id, a
//! share link, or an id with the transport's duplicated `X-X` artifact.

use crate::model::PeerId;
use url::Url;

/// Query parameter carrying the room id in share links.
pub const ROOM_ID_PARAM: &str = "roomId";

/// A trailing path segment is only taken as an id when longer than this.
const MIN_PATH_ID_LEN: usize = 5;

/// Reduce user input to a bare room id.
///
/// | input | output |
/// |---|---|
/// | `"  user_abc123  "` | `"user_abc123"` |
/// | `"http://localhost:5173/?roomId=user_abc123"` | `"user_abc123"` |
/// | `"https://chat.example/rooms/user_abc123"` | `"user_abc123"` |
/// | `"https://chat.example/abc"` | `"httpschatexampleabc"` |
/// | `"hwW6wz-hwW6wz"` | `"hwW6wz"` |
/// | `"peer-one"` | `"peer-one"` |
/// | `"user_ab!c?"` | `"user_abc"` |
pub fn canonical_room_id(input: &str) -> String {
    let trimmed = input.trim();
    let candidate = from_url(trimmed).unwrap_or_else(|| trimmed.to_string());
    let collapsed = collapse_duplicate(&candidate);
    collapsed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// `origin?roomId=<id>`.
pub fn share_link(origin: &str, room_id: &PeerId) -> String {
    format!("{origin}?{ROOM_ID_PARAM}={room_id}")
}

fn from_url(input: &str) -> Option<String> {
    let url = Url::parse(input).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if let Some((_, id)) = url.query_pairs().find(|(k, _)| k == ROOM_ID_PARAM) {
        let id = id.trim();
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .filter(|s| s.len() > MIN_PATH_ID_LEN)
        .map(str::to_string)
}

/// `X-X` → `X`. Any other dashed id is left alone.
fn collapse_duplicate(id: &str) -> &str {
    id.match_indices('-')
        .map(|(i, _)| (&id[..i], &id[i + 1..]))
        .find(|(left, right)| !left.is_empty() && left == right)
        .map(|(left, _)| left)
        .unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_id_trimmed() {
        assert_eq!(canonical_room_id("  user_abc123 \n"), "user_abc123");
    }

    #[test]
    fn test_share_link_query() {
        assert_eq!(
            canonical_room_id("http://localhost:5173/?roomId=user_abc123"),
            "user_abc123"
        );
        assert_eq!(
            canonical_room_id("https://chat.example/join?foo=1&roomId=%20user_x1y2z3"),
            "user_x1y2z3"
        );
    }

    #[test]
    fn test_path_segment() {
        assert_eq!(
            canonical_room_id("https://chat.example/rooms/user_abc123/"),
            "user_abc123"
        );
    }

    #[test]
    fn test_short_path_segment_not_taken() {
        assert_eq!(
            canonical_room_id("https://chat.example/abc"),
            "httpschatexampleabc"
        );
    }

    #[test]
    fn test_duplicated_id_collapsed() {
        assert_eq!(canonical_room_id("hwW6wz-hwW6wz"), "hwW6wz");
        assert_eq!(canonical_room_id("a-b-a-b"), "a-b");
    }

    #[test]
    fn test_other_dashed_ids_kept() {
        assert_eq!(canonical_room_id("peer-one"), "peer-one");
        assert_eq!(canonical_room_id("-abc"), "-abc");
    }

    #[test]
    fn test_foreign_characters_stripped() {
        assert_eq!(canonical_room_id("user_ab!c?"), "user_abc");
        assert_eq!(canonical_room_id(""), "");
    }

    #[test]
    fn test_share_link_round_trips() {
        let id = PeerId::new("user_q1w2e3r4t5");
        let link = share_link("http://localhost:5173/", &id);
        assert_eq!(link, "http://localhost:5173/?roomId=user_q1w2e3r4t5");
        assert_eq!(canonical_room_id(&link), id.as_str());
    }
}
