//! Write one illustrated story end to end.
//!
//! ```sh
//! STORY_TEXT_ENDPOINT=http://localhost:8080/api/story \
//! STORY_IMAGE_ENDPOINT=http://localhost:8080/api/images \
//! S3_PUB_URL_PREFIX=https://cdn.example/ \
//! cargo run --example write_story -- "a lighthouse keeper's cat"
//! ```

use std::sync::Arc;

use story_pipeline::backend::{HttpImageBackend, HttpTextBackend, StoryRequest};
use story_pipeline::models::DEFAULT_TEXT_MODEL;
use story_pipeline::reassembly;
use story_pipeline::{Event, FnEventHandler, GenerationState, ImageGenerator, StoryConfig, StoryWriter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "a robot learning to paint".to_string());
    let config = StoryConfig::from_env()?;

    let progress = Arc::new(FnEventHandler(|event: Event| match event {
        Event::Chunk { chunk, .. } => eprint!("{}", chunk),
        Event::ImageGenerated { prompt, url } => eprintln!("\n[image] {} -> {}", prompt, url),
        Event::ImageFailed { prompt, message } => eprintln!("\n[image] {}: {}", prompt, message),
        _ => {}
    }));

    let writer = StoryWriter::new(Arc::new(HttpTextBackend::from_config(&config)?), &config)
        .with_event_handler(progress.clone());
    let images = ImageGenerator::new(Arc::new(HttpImageBackend::from_config(&config)?), &config)
        .with_event_handler(progress);
    let follower = images.follow(writer.subscribe());

    writer
        .begin(StoryRequest::new(DEFAULT_TEXT_MODEL, prompt))
        .run()
        .await?;
    let story = writer.state();
    if let Some(error) = &story.error {
        anyhow::bail!("story failed: {}", error);
    }

    // Wait until every image in the final text has settled one way or the other.
    let mut board = images.subscribe();
    let settled = board.wait_for(|board| {
        story.elements.images().all(|element| {
            element.prompt().is_some_and(|prompt| {
                board.get(prompt).is_some_and(|image| {
                    matches!(
                        image.state,
                        GenerationState::Succeeded { .. } | GenerationState::Failed { .. }
                    )
                })
            })
        })
    });
    if tokio::time::timeout(config.image_timeout * 2, settled).await.is_err() {
        tracing::warn!("some images never settled");
    }
    follower.abort();

    println!(
        "\n\n{}",
        reassembly::serialize(&story.elements, &images.generated_urls())
    );
    Ok(())
}
