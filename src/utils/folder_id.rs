use regex::Regex;
use std::sync::OnceLock;

fn folders_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/folders/([A-Za-z0-9_-]+)").unwrap())
}

fn id_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").unwrap())
}

fn bare_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{10,}$").unwrap())
}

/// Pull a folder id out of a share URL. Accepts the `/folders/<id>`
/// path shape, the `?id=<id>` query shape, and an already-bare id.
pub fn extract_folder_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if let Some(caps) = folders_re().captures(trimmed) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = id_param_re().captures(trimmed) {
        return Some(caps[1].to_string());
    }
    if bare_id_re().is_match(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "1A2b3C4d5E6f7G8h9I0j";

    #[test]
    fn test_extracts_from_folders_url() {
        let url = format!("https://drive.google.com/drive/folders/{}?usp=sharing", ID);
        assert_eq!(extract_folder_id(&url).as_deref(), Some(ID));
    }

    #[test]
    fn test_extracts_from_id_query_param() {
        let url = format!("https://drive.google.com/open?id={}&authuser=0", ID);
        assert_eq!(extract_folder_id(&url).as_deref(), Some(ID));
        let amp = format!("https://drive.google.com/open?x=1&id={}", ID);
        assert_eq!(extract_folder_id(&amp).as_deref(), Some(ID));
    }

    #[test]
    fn test_bare_id_is_identity() {
        assert_eq!(extract_folder_id(ID).as_deref(), Some(ID));
    }

    #[test]
    fn test_rejects_short_or_invalid_input() {
        assert_eq!(extract_folder_id("short"), None);
        assert_eq!(extract_folder_id("has spaces in it"), None);
        assert_eq!(extract_folder_id("https://example.com/nothing-here"), None);
    }
}
