//! Basic resilience layer usage example

use mcp_resilience::{CircuitBreaker, CircuitError, RetryConfig, RetryHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Resilience Basic Example ===\n");

    let breaker = Arc::new(
        CircuitBreaker::builder("weather_api")
            .failure_threshold(3)
            .open_timeout(Duration::from_secs(2))
            .half_open_max_calls(2)
            .on_open(|name| println!("Circuit '{}' opened!", name))
            .on_close(|name| println!("Circuit '{}' closed!", name))
            .on_half_open(|name| println!("Circuit '{}' half-open, probing...", name))
            .build(),
    );
    let retry = RetryHandler::new(
        "weather",
        RetryConfig::default()
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(100)),
    );

    println!("Initial state: {}\n", breaker.state());

    println!("--- Transient blip, recovered by retry ---");
    let calls = AtomicU32::new(0);
    let result = retry.execute_with_retry(|| {
        breaker.execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("connection reset".to_string())
            } else {
                Ok("Seoul: 21°C")
            }
        })
    });
    println!("Result: {:?} after {} calls\n", result, calls.load(Ordering::SeqCst));

    println!("--- Dependency down ---");
    let result: Result<&str, _> =
        retry.execute_with_retry(|| breaker.execute(|| Err("503 Service Unavailable".to_string())));
    match result {
        Err(e) => println!("Gave up: {}", e),
        Ok(v) => println!("Unexpected success: {}", v),
    }
    println!("State: {} (circuit opened)\n", breaker.state());

    println!("--- Attempting call while open ---");
    match breaker.execute(|| Ok::<_, String>("Should be rejected")) {
        Err(CircuitError::Open { circuit }) => println!("Rejected fast by '{}'", circuit),
        other => println!("Unexpected: {:?}", other),
    }
    println!();

    println!("--- Waiting for cool-down ---");
    std::thread::sleep(Duration::from_millis(2100));
    for i in 1..=2 {
        match breaker.execute(move || Ok::<_, String>(format!("Probe {} ok", i))) {
            Ok(result) => println!("{} (state: {})", result, breaker.state()),
            Err(e) => println!("{}", e),
        }
    }
}
