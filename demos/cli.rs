//! Command-line demo wiring a `Dispatcher` to a `MockChatEndpoint`.
//!
//! Run with:
//!   cargo run --example cli -- "summarize this" "translate that" "explain the other thing"

use dispatcher::{
    ChatCompletionResponse, Dispatcher, DispatcherConfig, MockChatEndpoint, PricingTable, Usage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dispatcher::init_tracing();

    let inputs: Vec<String> = std::env::args().skip(1).collect();
    let inputs = if inputs.is_empty() {
        vec!["hello".to_string(), "world".to_string(), "from the demo".to_string()]
    } else {
        inputs
    };

    let pricing = PricingTable::from_json(
        r#"{"demo-model": {"input": 0.001, "output": 0.002, "cache": 0.0005}}"#,
    )?;

    let endpoint = MockChatEndpoint::new();
    for _ in &inputs {
        endpoint.add_response(
            "demo-model",
            Ok(ChatCompletionResponse {
                content: "a mocked completion".to_string(),
                usage: Usage {
                    prompt_tokens: 40,
                    completion_tokens: 20,
                    cached_tokens: 10,
                    total_tokens: 60,
                },
            }),
        );
    }

    let config = DispatcherConfig::new("demo-model", "demo-key", "https://api.example.com")
        .with_max_concurrent(4);
    let dispatcher = Dispatcher::new(config, pricing, endpoint)?;

    let (results, batch_stats, batch_id) = dispatcher
        .submit_batch(inputs, "Respond to: {text}", None, None, None)
        .await?;

    println!("batch {batch_id}");
    for result in &results {
        println!(
            "  {} success={} tokens={} cost={:.6} latency={:?}",
            result.id, result.success, result.tokens_used, result.cost, result.api_response_time
        );
    }

    println!(
        "totals: {} requests, {:.6} cost, {:.1}% cache hit rate, {} retries",
        batch_stats.total_requests,
        batch_stats.cost_sum,
        batch_stats.cache_hit_rate() * 100.0,
        batch_stats.retry_count
    );

    Ok(())
}
