//! Profile extraction from a rendered or fetched profile page.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use super::ProfileData;
use crate::normalizer::extract::{unescape_js, unescape_url};

/// Most photos kept from one profile.
pub const MAX_PHOTOS: usize = 12;

static OG_DESCRIPTION: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:description"]"#).expect("invalid og:description selector")
});
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("invalid title selector"));
static IMAGES: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").expect("invalid img selector"));

static FOLLOWERS: Lazy<Regex> = Lazy::new(|| count_regex("followers"));
static FOLLOWING: Lazy<Regex> = Lazy::new(|| count_regex("following"));
static POSTS: Lazy<Regex> = Lazy::new(|| count_regex("posts"));
static TITLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^(@•]+?)(?:\s*\(@|\s*•)").expect("invalid title regex"));
static FULL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""full_name"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("invalid full_name regex"));
static BIOGRAPHY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""biography"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("invalid biography regex"));
static AVATAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""profile_pic_url(?:_hd)?"\s*:\s*"([^"]+)""#).expect("invalid avatar regex")
});
static DISPLAY_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""display_url"\s*:\s*"([^"]+)""#).expect("invalid display_url regex"));
static FOLLOWER_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""edge_followed_by"\s*:\s*\{\s*"count"\s*:\s*(\d+)|"follower_count"\s*:\s*(\d+)"#)
        .expect("invalid follower count regex")
});
static FOLLOWING_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""edge_follow"\s*:\s*\{\s*"count"\s*:\s*(\d+)|"following_count"\s*:\s*(\d+)"#)
        .expect("invalid following count regex")
});

fn count_regex(label: &str) -> Regex {
    Regex::new(&format!(r"(?i)([\d,.]+[KkMm]?)\s*{label}")).expect("invalid count regex")
}

/// `1.5K`, `2,345`, `3M` style counters.
pub fn parse_count(text: &str) -> Option<u64> {
    let text = text.replace(',', "");
    let text = text.trim();
    let (number, multiplier) = match text.chars().last()? {
        'K' | 'k' => (&text[..text.len() - 1], 1_000.0),
        'M' | 'm' => (&text[..text.len() - 1], 1_000_000.0),
        _ => (text, 1.0),
    };
    let value: f64 = number.parse().ok()?;
    Some((value * multiplier).round() as u64)
}

pub fn is_login_page(url: &str) -> bool {
    url.contains("/accounts/login")
}

fn capture_text(regex: &Regex, html: &str) -> Option<String> {
    regex
        .captures_iter(html)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_js(m.as_str()).trim().to_string())
        .find(|text| !text.is_empty())
}

fn capture_count(regex: &Regex, html: &str) -> Option<u64> {
    let caps = regex.captures(html)?;
    caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()
}

fn thumbnail(url: &str) -> bool {
    url.contains("s150x150") || url.contains("s320x320")
}

/// Parse a profile page. `username` is the handle that was requested.
pub fn parse_profile_page(html: &str, username: &str) -> ProfileData {
    let document = Html::parse_document(html);
    let mut profile = ProfileData {
        username: username.to_string(),
        ..Default::default()
    };

    if let Some(description) = document
        .select(&OG_DESCRIPTION)
        .find_map(|meta| meta.value().attr("content"))
    {
        let count = |regex: &Regex| {
            regex
                .captures(description)
                .and_then(|caps| caps.get(1))
                .and_then(|m| parse_count(m.as_str()))
        };
        profile.followers = count(&FOLLOWERS);
        profile.following = count(&FOLLOWING);
        profile.posts = count(&POSTS);
    }
    profile.followers = profile.followers.or_else(|| capture_count(&FOLLOWER_COUNT, html));
    profile.following = profile.following.or_else(|| capture_count(&FOLLOWING_COUNT, html));

    profile.full_name = capture_text(&FULL_NAME, html).or_else(|| {
        let title = document.select(&TITLE).next()?.text().collect::<String>();
        TITLE_NAME
            .captures(title.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|name| !name.is_empty())
    });
    profile.biography = capture_text(&BIOGRAPHY, html);
    profile.is_private = html.contains(r#""is_private":true"#);
    profile.is_verified = html.contains(r#""is_verified":true"#);
    profile.avatar = AVATAR
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape_url(m.as_str()));

    let mut photos: Vec<String> = Vec::new();
    for caps in DISPLAY_URL.captures_iter(html) {
        let url = unescape_url(&caps[1]);
        if !thumbnail(&url) && !photos.contains(&url) {
            photos.push(url);
        }
        if photos.len() == MAX_PHOTOS {
            break;
        }
    }
    if photos.is_empty() {
        photos = document
            .select(&IMAGES)
            .filter_map(|img| img.value().attr("src"))
            .filter(|src| src.contains("cdninstagram") || src.contains("fbcdn"))
            .filter(|src| !thumbnail(src) && Some(*src) != profile.avatar.as_deref())
            .map(|src| src.to_string())
            .fold(Vec::new(), |mut acc, src| {
                if !acc.contains(&src) && acc.len() < MAX_PHOTOS {
                    acc.push(src);
                }
                acc
            });
    }
    profile.photos = photos;
    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_with_suffixes() {
        assert_eq!(parse_count("1.5K"), Some(1_500));
        assert_eq!(parse_count("2,345"), Some(2_345));
        assert_eq!(parse_count("3M"), Some(3_000_000));
        assert_eq!(parse_count("abc"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn parses_page_with_embedded_json() {
        let html = r#"<html><head>
            <title>Jane Doe (@jane) • Instagram photos and videos</title>
            <meta property="og:description" content="1.2K Followers, 300 Following, 45 Posts - See Instagram photos">
            </head><body><script type="application/json">
            {"full_name":"Jane Doe","biography":"Line one\nLine two","is_private":false,"is_verified":true,
             "profile_pic_url_hd":"https:\/\/scontent.cdninstagram.com\/avatar.jpg?a=1&b=2",
             "display_url":"https:\/\/scontent.cdninstagram.com\/p1.jpg",
             "display_url":"https:\/\/scontent.cdninstagram.com\/s150x150\/thumb.jpg",
             "display_url":"https:\/\/scontent.cdninstagram.com\/p1.jpg",
             "display_url":"https:\/\/scontent.cdninstagram.com\/p2.jpg"}
            </script></body></html>"#;
        let profile = parse_profile_page(html, "jane");
        assert_eq!(profile.username, "jane");
        assert_eq!(profile.full_name.as_deref(), Some("Jane Doe"));
        assert_eq!(profile.biography.as_deref(), Some("Line one\nLine two"));
        assert_eq!(profile.followers, Some(1_200));
        assert_eq!(profile.following, Some(300));
        assert_eq!(profile.posts, Some(45));
        assert!(profile.is_verified);
        assert!(!profile.is_private);
        assert_eq!(
            profile.avatar.as_deref(),
            Some("https://scontent.cdninstagram.com/avatar.jpg?a=1&b=2")
        );
        assert_eq!(
            profile.photos,
            vec![
                "https://scontent.cdninstagram.com/p1.jpg".to_string(),
                "https://scontent.cdninstagram.com/p2.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn falls_back_to_title_and_images() {
        let html = r#"<html><head><title>Ivan Petrov • Instagram</title></head><body>
            <img src="https://scontent-arn2-1.cdninstagram.com/v/t51/post.jpg">
            <img src="https://static.cdninstagram.com/rsrc/logo.png">
            <img src="https://example.com/other.jpg">
            </body></html>"#;
        let profile = parse_profile_page(html, "ivan");
        assert_eq!(profile.full_name.as_deref(), Some("Ivan Petrov"));
        assert_eq!(profile.photos.len(), 2);
        assert!(profile.photos[0].ends_with("post.jpg"));
    }

    #[test]
    fn login_redirect_detection() {
        assert!(is_login_page("https://www.instagram.com/accounts/login/?next=/jane/"));
        assert!(!is_login_page("https://www.instagram.com/jane/"));
    }
}
