use std::env;
use std::error::Error;
use std::sync::Arc;

use lookup_orchestrator::{
    EngineConfig, InstagramSource, Orchestrator, ProviderId, Query, VERSION, VkSource,
    WhatsAppSource, WhoCallsSource,
};
use tokio::runtime::Runtime;

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// Live lookups against real providers.
///
/// `LOOKUP_PHONE` and/or `LOOKUP_HANDLE` select the queries. Providers are
/// enabled by their credentials: `VK_TOKEN`, `GREEN_API_INSTANCE` plus
/// `GREEN_API_TOKEN`, `INSTAGRAM_ACCOUNT` (an account line). Who Calls needs
/// nothing. `LOOKUP_CONFIG` may point at an engine config JSON file.
#[test]
#[ignore = "Requires network access and provider credentials"]
fn live_lookup_smoke() -> Result<(), Box<dyn Error>> {
    println!("lookup-orchestrator {} live smoke test", VERSION);

    let config = match var("LOOKUP_CONFIG") {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let mut builder = Orchestrator::builder()
        .with_config(config)
        .with_source(Arc::new(WhoCallsSource::new()));
    if let Some(token) = var("VK_TOKEN") {
        builder = builder.with_source(Arc::new(VkSource::new([token])));
    }
    if let (Some(instance), Some(token)) = (var("GREEN_API_INSTANCE"), var("GREEN_API_TOKEN")) {
        builder = builder.with_source(Arc::new(WhatsAppSource::new(instance, token)));
    }
    let mut instagram = InstagramSource::new();
    if let Some(line) = var("INSTAGRAM_ACCOUNT") {
        instagram = instagram.with_account_lines([line.as_str()])?;
    }
    builder = builder.with_instagram(instagram);

    let engine = builder.build()?;
    let runtime = Runtime::new()?;
    println!("providers: {:?}", engine.providers());

    let mut queries = Vec::new();
    if let Some(phone) = var("LOOKUP_PHONE") {
        queries.push(Query::phone(phone)?);
    }
    if let Some(handle) = var("LOOKUP_HANDLE") {
        queries.push(Query::handle(handle)?);
    }
    if queries.is_empty() {
        println!("set LOOKUP_PHONE or LOOKUP_HANDLE to run lookups");
        return Ok(());
    }

    for query in &queries {
        println!("\n--- {} ({:?}) ---", query.normalized_id(), query.kind());
        let results = runtime.block_on(engine.lookup_all(query));
        for result in &results {
            println!(
                "{:<10} {:<12} name={:?} spam={} photos={} error={:?}",
                result.provider.as_str(),
                result.status.as_str(),
                result.display_name,
                result.is_spam,
                result.photos.len(),
                result.error
            );
        }

        let photo = results
            .iter()
            .find_map(|result| result.current_photo())
            .map(|photo| photo.url.clone());
        if let Some(url) = photo {
            let body = runtime.block_on(engine.download_photo(&url));
            println!("current photo {url}: {:?} bytes", body.map(|b| b.len()));
        }
    }

    if let Some(snapshot) = engine.metrics() {
        println!("\nmetrics: {:#?}", snapshot);
    }
    for (provider, health) in engine.account_health() {
        println!(
            "{provider}: {} of {} account(s) available",
            health.available_accounts, health.total_accounts
        );
    }
    assert!(engine.providers().contains(&ProviderId::WhoCalls));

    runtime.block_on(engine.shutdown());
    Ok(())
}
