use std::sync::LazyLock;

use regex::Regex;

use crate::types::PostId;

// Hosts: twitter.com and x.com (optionally www./mobile.).
// Paths: /<user>/status/<id>, /<user>/statuses/<id>, /<user>/post/<id>, /i/status/<id>.
static POST_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:https?://)?(?:www\.|mobile\.)?\b(?:twitter\.com|x\.com)/(?:[A-Za-z0-9_]{1,15}/)?(?:status|statuses|post)/(\d+)",
    )
    .ok()
});

/// Pull the trailing numeric post id out of the first recognised post URL in `text`.
pub fn extract_post_id(text: &str) -> Option<PostId> {
    let re = POST_URL.as_ref()?;
    let caps = re.captures(text)?;
    caps.get(1).map(|m| PostId::new(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::extract_post_id;

    #[test]
    fn extracts_id_from_every_known_shape() {
        let hosts = ["twitter.com", "x.com"];
        let paths = [
            "someone/status/1234567890",
            "someone/statuses/1234567890",
            "someone/post/1234567890",
            "i/status/1234567890",
        ];
        for host in hosts {
            for path in paths {
                let url = format!("https://{host}/{path}");
                let id = extract_post_id(&url).map(|p| p.0);
                assert_eq!(id.as_deref(), Some("1234567890"), "url: {url}");
            }
        }
    }

    #[test]
    fn extracts_id_from_surrounding_text_and_query() {
        let text = "go raid this https://www.x.com/Foo_Bar/status/1789?s=20&t=abc now";
        assert_eq!(extract_post_id(text).map(|p| p.0).as_deref(), Some("1789"));
        let text = "http://mobile.twitter.com/foo/status/555/photo/1";
        assert_eq!(extract_post_id(text).map(|p| p.0).as_deref(), Some("555"));
    }

    #[test]
    fn ignores_unrelated_links() {
        assert!(extract_post_id("https://example.com/foo/status/123").is_none());
        assert!(extract_post_id("https://netflix.com/foo/status/123").is_none());
        assert!(extract_post_id("https://x.com/foo").is_none());
        assert!(extract_post_id("just chatting").is_none());
    }
}
