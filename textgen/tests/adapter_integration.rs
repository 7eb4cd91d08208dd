use futures::StreamExt;
use textgen::{
    AdapterError, AdapterFactory, BackendKind, DebugAdapter, GenerationAdapter,
    GenerationOptions, OptionOverrides, StopSpecification,
};

/// Adapter-level tests that run without model weights or network access,
/// exercising the one-contract guarantee through the debug backend.

async fn collect(mut stream: textgen::TokenStream) -> Result<String, AdapterError> {
    let mut out = String::new();
    while let Some(item) = stream.next().await {
        out.push_str(&item?);
    }
    Ok(out)
}

#[tokio::test]
async fn test_streaming_matches_blocking() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = DebugAdapter::with_reply(
        "The answer is 42. STOP and some trailing text",
        GenerationOptions::default(),
    )?;
    let stop = StopSpecification::new(vec!["STOP"])?;

    let blocking = adapter
        .generate("question", OptionOverrides::default(), &stop)
        .await?;
    let stream = adapter
        .generate_stream("question", OptionOverrides::default(), &stop)
        .await?;
    let streamed = collect(stream).await?;

    assert_eq!(blocking, streamed);
    assert_eq!(blocking, "The answer is 42. ");
    Ok(())
}

#[tokio::test]
async fn test_streaming_without_stops_passes_everything_through(
) -> Result<(), Box<dyn std::error::Error>> {
    let adapter = DebugAdapter::with_reply("alpha beta gamma", GenerationOptions::default())?;
    let stream = adapter
        .generate_stream("question", OptionOverrides::default(), &StopSpecification::none())
        .await?;
    assert_eq!(collect(stream).await?, "alpha beta gamma");
    Ok(())
}

#[tokio::test]
async fn test_stop_spanning_increment_boundary() -> Result<(), Box<dyn std::error::Error>> {
    // The stop begins inside the final word-sized piece, so only the text
    // before the match start is forwarded from that piece.
    let adapter = DebugAdapter::with_reply("one two three", GenerationOptions::default())?;
    let stop = StopSpecification::new(vec!["hree"])?;
    let stream = adapter
        .generate_stream("question", OptionOverrides::default(), &stop)
        .await?;
    assert_eq!(collect(stream).await?, "one two t");
    Ok(())
}

#[tokio::test]
async fn test_unload_is_terminal_and_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = DebugAdapter::new(GenerationOptions::default())?;
    adapter.unload().await?;
    adapter.unload().await?;

    let blocking = adapter
        .generate("q", OptionOverrides::default(), &StopSpecification::none())
        .await;
    assert!(matches!(blocking, Err(AdapterError::Unloaded(_))));

    let streaming = adapter
        .generate_stream("q", OptionOverrides::default(), &StopSpecification::none())
        .await;
    assert!(matches!(streaming, Err(AdapterError::Unloaded(_))));
    Ok(())
}

#[tokio::test]
async fn test_dropping_stream_early_is_clean() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = DebugAdapter::with_reply("one two three four", GenerationOptions::default())?;
    let mut stream = adapter
        .generate_stream("q", OptionOverrides::default(), &StopSpecification::none())
        .await?;
    let first = stream.next().await;
    assert_eq!(first.transpose()?, Some("one ".to_string()));
    drop(stream);

    // The adapter stays usable after an abandoned stream.
    let again = adapter
        .generate("q", OptionOverrides::default(), &StopSpecification::none())
        .await?;
    assert_eq!(again, "one two three four");
    Ok(())
}

#[tokio::test]
async fn test_invalid_overrides_rejected_before_generation(
) -> Result<(), Box<dyn std::error::Error>> {
    let adapter = DebugAdapter::new(GenerationOptions::default())?;
    let overrides = OptionOverrides {
        top_p: Some(1.5),
        ..Default::default()
    };
    let result = adapter
        .generate("q", overrides.clone(), &StopSpecification::none())
        .await;
    assert!(matches!(result, Err(AdapterError::InvalidOptions(_))));

    let result = adapter
        .generate_stream("q", overrides, &StopSpecification::none())
        .await;
    assert!(matches!(result, Err(AdapterError::InvalidOptions(_))));
    Ok(())
}

#[tokio::test]
async fn test_factory_builds_debug_backend() -> Result<(), Box<dyn std::error::Error>> {
    let adapter = AdapterFactory::new("debug").build().await?;
    assert_eq!(adapter.model_id(), "debug");
    let reply = adapter
        .generate("hello", OptionOverrides::default(), &StopSpecification::none())
        .await?;
    assert!(!reply.is_empty());
    Ok(())
}

#[test]
fn test_backend_detection_table() {
    let cases = [
        ("debug", BackendKind::Debug),
        ("https://api.example.com/v1", BackendKind::RemoteApi),
        ("openai:gpt-4o-mini", BackendKind::RemoteApi),
        ("TheBloke/Mistral-7B-GGUF", BackendKind::LocalQuantized),
        ("org/model-GPTQ", BackendKind::LocalQuantized),
        ("models/llama-f16.gguf", BackendKind::LocalWeights),
        ("meta-llama/Llama-3-8B", BackendKind::LocalWeights),
    ];
    for (model_id, expected) in cases {
        assert_eq!(
            textgen::detect_backend_kind(model_id),
            expected,
            "for {model_id:?}"
        );
    }
}

#[tokio::test]
async fn test_longest_stop_wins_at_same_position() -> Result<(), Box<dyn std::error::Error>> {
    // Both stops match at the same index; the longer one defines the match,
    // but truncation happens at the shared start either way. The earlier
    // occurrence always wins across different positions.
    let adapter = DebugAdapter::with_reply(
        "Answer: done END more END-OF-TEXT tail",
        GenerationOptions::default(),
    )?;
    let stop = StopSpecification::new(vec!["END-OF-TEXT", "END"])?;
    let out = adapter
        .generate("q", OptionOverrides::default(), &stop)
        .await?;
    assert_eq!(out, "Answer: done ");
    Ok(())
}
