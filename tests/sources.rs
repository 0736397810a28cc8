//! Adapters against stubbed provider APIs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lookup_orchestrator::{
    Account, BrowserConfig, BrowserCookie, BrowserDriver, CaptchaKind, DriverError, DriverLauncher,
    EngineConfig, InstagramSource, LookupStatus, Orchestrator, PageSnapshot, PhotoKind, ProviderId,
    Query, VkSource, WhatsAppSource,
};

const PROFILE_API: &str = "/api/v1/users/web_profile_info/";
const RENDERED: &str = r#"<html><head><title>Jane Doe (@jane)</title></head><body><script>
    {"display_url":"https:\/\/scontent.cdninstagram.com\/p1.jpg"},
    {"display_url":"https:\/\/scontent.cdninstagram.com\/p2.jpg"}
</script></body></html>"#;

/// Browser that serves the rendered profile and records what it was given.
#[derive(Default)]
struct Render {
    navigations: Vec<String>,
    cookies: Vec<BrowserCookie>,
}

struct RenderDriver(Arc<Mutex<Render>>);

#[async_trait]
impl BrowserDriver for RenderDriver {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        self.0.lock().unwrap().navigations.push(url.to_string());
        Ok(())
    }

    async fn dismiss_overlays(&mut self, _selectors: &[String]) -> Result<bool, DriverError> {
        Ok(false)
    }

    async fn focus_input(&mut self, _selectors: &[String]) -> Result<(), DriverError> {
        Ok(())
    }

    async fn type_char(&mut self, _c: char) -> Result<(), DriverError> {
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn snapshot(&mut self) -> Result<PageSnapshot, DriverError> {
        Ok(PageSnapshot {
            url: "https://www.instagram.com/jane/".into(),
            html: RENDERED.into(),
            body_text: String::new(),
        })
    }

    async fn inject_captcha_solution(&mut self, _kind: CaptchaKind, _token: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn set_cookies(&mut self, cookies: &[BrowserCookie]) -> Result<(), DriverError> {
        self.0.lock().unwrap().cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn scroll(&mut self, _times: u32) -> Result<(), DriverError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct RenderLauncher(Arc<Mutex<Render>>);

#[async_trait]
impl DriverLauncher for RenderLauncher {
    async fn launch(&self, _config: &BrowserConfig) -> Result<Box<dyn BrowserDriver>, DriverError> {
        Ok(Box::new(RenderDriver(self.0.clone())))
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.browser.keystroke_delay_ms = 0;
    config.browser.settle_delay_ms = 0;
    config.browser.attempt_delay_ms = 0;
    config.retry.backoff_ms = 0;
    config
}

fn instagram(server: &MockServer) -> (Orchestrator, Arc<Mutex<Render>>) {
    let render = Arc::new(Mutex::new(Render::default()));
    let source = InstagramSource::new()
        .with_account(Account::parse("jane:pw|Agent/1.0|sessionid=abc").unwrap())
        .with_web_base(server.uri());
    let engine = Orchestrator::builder()
        .with_config(config())
        .with_instagram(source)
        .with_browser_launcher(Arc::new(RenderLauncher(render.clone())))
        .build()
        .unwrap();
    (engine, render)
}

fn api_user(is_private: bool, edges: Value) -> Value {
    json!({"data": {"user": {
        "username": "jane",
        "full_name": "Jane Doe",
        "is_private": is_private,
        "profile_pic_url_hd": "https://scontent.cdninstagram.com/avatar.jpg",
        "edge_followed_by": {"count": 120},
        "edge_owner_to_timeline_media": {"count": 2, "edges": edges}
    }}})
}

async fn answer(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

fn jane() -> Query {
    Query::handle("jane").unwrap()
}

fn urls(photos: &[lookup_orchestrator::PhotoRef]) -> Vec<&str> {
    photos.iter().map(|photo| photo.url.as_str()).collect()
}

#[tokio::test]
async fn instagram_public_profile_without_posts_is_rendered() {
    let server = MockServer::start().await;
    answer(
        &server,
        PROFILE_API,
        ResponseTemplate::new(200).set_body_json(api_user(false, json!([]))),
    )
    .await;
    let (engine, render) = instagram(&server);

    let result = engine.lookup(ProviderId::Instagram, &jane()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.display_name.as_deref(), Some("Jane Doe"));
    assert_eq!(result.details.followers, Some(120));
    assert_eq!(
        urls(&result.photos),
        vec![
            "https://scontent.cdninstagram.com/avatar.jpg",
            "https://scontent.cdninstagram.com/p1.jpg",
            "https://scontent.cdninstagram.com/p2.jpg",
        ]
    );
    assert_eq!(result.photos[0].kind, PhotoKind::Current);

    let render = render.lock().unwrap();
    assert_eq!(render.navigations, vec![format!("{}/jane/", server.uri())]);
    assert_eq!(render.cookies.len(), 1);
    assert_eq!(render.cookies[0].name, "sessionid");
}

#[tokio::test]
async fn instagram_private_profile_is_not_rendered() {
    let server = MockServer::start().await;
    answer(
        &server,
        PROFILE_API,
        ResponseTemplate::new(200).set_body_json(api_user(true, json!([]))),
    )
    .await;
    let (engine, render) = instagram(&server);

    let result = engine.lookup(ProviderId::Instagram, &jane()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.details.is_private, Some(true));
    assert_eq!(urls(&result.photos), vec!["https://scontent.cdninstagram.com/avatar.jpg"]);
    assert!(render.lock().unwrap().navigations.is_empty());
}

#[tokio::test]
async fn instagram_falls_back_to_the_browser_when_direct_fetch_fails() {
    let server = MockServer::start().await;
    answer(&server, PROFILE_API, ResponseTemplate::new(500)).await;
    answer(&server, "/jane/", ResponseTemplate::new(502)).await;
    let (engine, render) = instagram(&server);

    let result = engine.lookup(ProviderId::Instagram, &jane()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.display_name.as_deref(), Some("Jane Doe"));
    assert_eq!(result.details.username.as_deref(), Some("jane"));
    assert_eq!(result.photos.len(), 2);
    assert_eq!(render.lock().unwrap().navigations.len(), 1);

    let health = engine.account_health();
    let instagram = &health[&ProviderId::Instagram];
    assert_eq!(instagram.cooling_accounts, 0);
    assert_eq!(instagram.details["jane"].successes, 1);
}

#[tokio::test]
async fn instagram_refused_session_is_cooled_down_after_render() {
    let server = MockServer::start().await;
    answer(&server, PROFILE_API, ResponseTemplate::new(401)).await;
    let (engine, render) = instagram(&server);

    let result = engine.lookup(ProviderId::Instagram, &jane()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.photos.len(), 2);

    let render = render.lock().unwrap();
    assert_eq!(render.navigations.len(), 1);
    assert!(render.cookies.is_empty());

    let health = engine.account_health();
    let instagram = &health[&ProviderId::Instagram];
    assert_eq!(instagram.cooling_accounts, 1);
    assert_eq!(instagram.available_accounts, 0);
    assert_eq!(instagram.details["jane"].successes, 0);
}

#[tokio::test]
async fn instagram_missing_profile_skips_the_browser() {
    let server = MockServer::start().await;
    answer(&server, PROFILE_API, ResponseTemplate::new(404)).await;
    let (engine, render) = instagram(&server);

    let result = engine.lookup(ProviderId::Instagram, &jane()).await;
    assert_eq!(result.status, LookupStatus::NotFound);
    assert!(render.lock().unwrap().navigations.is_empty());
}

fn vk(server: &MockServer) -> Orchestrator {
    let source = VkSource::new(["vk1.a.stub-token"]).with_api_base(server.uri());
    Orchestrator::builder()
        .with_config(config())
        .with_source(Arc::new(source))
        .build()
        .unwrap()
}

async fn vk_user(server: &MockServer) {
    let body = json!({"response": [{
        "id": 1,
        "first_name": "Pavel",
        "last_name": "Durov",
        "screen_name": "durov",
        "is_closed": false,
        "photo_max_orig": "https://sun9-1.userapi.com/avatar.jpg",
        "city": {"title": "Dubai"}
    }]});
    Mock::given(method("GET"))
        .and(path("/users.get"))
        .and(query_param("user_ids", "durov"))
        .and(query_param("access_token", "vk1.a.stub-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

async fn vk_album(server: &MockServer, album: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path("/photos.get"))
        .and(query_param("owner_id", "1"))
        .and(query_param("album_id", album))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(server)
        .await;
}

fn vk_photos(urls: &[&str]) -> Value {
    let items: Vec<Value> = urls
        .iter()
        .map(|url| json!({"sizes": [
            {"type": "s", "url": format!("{url}?size=s")},
            {"type": "w", "url": url}
        ]}))
        .collect();
    json!({"response": {"count": items.len(), "items": items}})
}

#[tokio::test]
async fn vk_profile_fans_out_over_albums() {
    let server = MockServer::start().await;
    vk_user(&server).await;
    vk_album(&server, "profile", vk_photos(&["https://sun9-1.userapi.com/avatar.jpg", "https://sun9-1.userapi.com/p1.jpg"])).await;
    vk_album(&server, "wall", vk_photos(&["https://sun9-1.userapi.com/w1.jpg"])).await;
    vk_album(&server, "saved", json!({"error": {"error_code": 200, "error_msg": "Access denied"}})).await;
    let engine = vk(&server);

    let result = engine.lookup(ProviderId::Vk, &Query::handle("https://vk.com/durov").unwrap()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.display_name.as_deref(), Some("Pavel Durov"));
    assert_eq!(result.details.city.as_deref(), Some("Dubai"));
    assert_eq!(
        urls(&result.photos),
        vec![
            "https://sun9-1.userapi.com/avatar.jpg",
            "https://sun9-1.userapi.com/p1.jpg",
            "https://sun9-1.userapi.com/w1.jpg",
        ]
    );
    assert_eq!(result.photos[0].kind, PhotoKind::Current);
}

#[tokio::test]
async fn vk_closed_profile_album_hides_the_result() {
    let server = MockServer::start().await;
    vk_user(&server).await;
    vk_album(&server, "profile", vk_photos(&["https://sun9-1.userapi.com/p1.jpg"])).await;
    vk_album(&server, "wall", json!({"error": {"error_code": 30, "error_msg": "This profile is private"}})).await;
    vk_album(&server, "saved", vk_photos(&[])).await;
    let engine = vk(&server);

    let result = engine.lookup(ProviderId::Vk, &Query::handle("durov").unwrap()).await;
    assert_eq!(result.status, LookupStatus::Hidden);
    assert!(result.photos.is_empty());
}

fn whatsapp(server: &MockServer) -> Orchestrator {
    let source = WhatsAppSource::new("1101", "wa-token").with_api_base(server.uri());
    Orchestrator::builder()
        .with_config(config())
        .with_source(Arc::new(source))
        .build()
        .unwrap()
}

async fn green_api(server: &MockServer, call: &str, body: Value, times: u64) {
    Mock::given(method("POST"))
        .and(path(format!("/waInstance1101/{call}/wa-token")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

fn phone() -> Query {
    Query::phone("+7 916 123-45-67").unwrap()
}

#[tokio::test]
async fn whatsapp_unregistered_number_is_not_found() {
    let server = MockServer::start().await;
    green_api(&server, "checkWhatsapp", json!({"existsWhatsapp": false}), 1).await;
    green_api(&server, "getContactInfo", json!({"name": "unused"}), 0).await;
    green_api(&server, "getAvatar", json!({"urlAvatar": "https://pps.whatsapp.net/a.jpg"}), 0).await;
    let engine = whatsapp(&server);

    let result = engine.lookup(ProviderId::WhatsApp, &phone()).await;
    assert_eq!(result.status, LookupStatus::NotFound);
    assert!(result.photos.is_empty());
}

#[tokio::test]
async fn whatsapp_registered_number_collects_contact_and_avatars() {
    let server = MockServer::start().await;
    green_api(&server, "checkWhatsapp", json!({"existsWhatsapp": true}), 1).await;
    green_api(&server, "getContactInfo", json!({"name": "Марина", "about": "на связи"}), 1).await;
    green_api(&server, "getAvatar", json!({"urlAvatar": "https://pps.whatsapp.net/a.jpg"}), 1).await;
    green_api(
        &server,
        "getAvatars",
        json!({"avatars": ["https://pps.whatsapp.net/old.jpg", "https://pps.whatsapp.net/a.jpg"]}),
        1,
    )
    .await;
    let engine = whatsapp(&server);

    let result = engine.lookup(ProviderId::WhatsApp, &phone()).await;
    assert_eq!(result.status, LookupStatus::Found);
    assert_eq!(result.display_name.as_deref(), Some("Марина"));
    assert_eq!(result.details.biography.as_deref(), Some("на связи"));
    assert_eq!(
        urls(&result.photos),
        vec!["https://pps.whatsapp.net/a.jpg", "https://pps.whatsapp.net/old.jpg"]
    );
}
