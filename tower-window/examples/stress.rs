use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower::service_fn;
use tower_window::WindowError;
use tower_window::WindowLimitLayer;
use tracing_subscriber::EnvFilter;
use window_limit::Limiter;
use window_limit::LimiterKind;
use window_limit::LimiterRegistry;
use window_limit::LimiterSettings;
use window_limit::MetricsSnapshot;
use window_limit::RegistryConfig;

/// Fire a burst of requests at a mock backend through a window limiter.
#[derive(Debug, Parser)]
struct Args {
    /// Requests allowed per window
    #[arg(long, default_value_t = 1_000)]
    limit: i64,

    /// Window length in seconds
    #[arg(long, default_value_t = 1.0)]
    window_secs: f64,

    /// Total requests to send
    #[arg(long, default_value_t = 5_000)]
    requests: usize,

    /// Budget for admission plus the backend call, in milliseconds
    #[arg(long, default_value_t = 1_500)]
    timeout_ms: u64,

    /// Simulated backend latency, in milliseconds
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// Registry configuration file; overrides the limit flags
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Default)]
struct RejectionCounter {
    timeouts: usize,
    cancelled: usize,
    inner: usize,
}

async fn run_load_test<S>(name: &str, svc: S, total_reqs: usize)
where
    S: Service<(), Response = &'static str, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send,
{
    let mut hist_elapsed = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    let mut hist_ready = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();

    let mut tasks = JoinSet::new();
    let mut rejections = RejectionCounter::default();

    let start = Instant::now();
    let barrier = Arc::new(Barrier::new(total_reqs));

    for _ in 0..total_reqs {
        let mut local_svc = svc.clone();
        let bar = barrier.clone();
        tasks.spawn(async move {
            bar.wait().await;
            let req_start = Instant::now();
            let ready_res = local_svc.ready().await;
            let ready = req_start.elapsed();

            match ready_res {
                Ok(ready_svc) => {
                    let res = ready_svc.call(()).await;
                    (res, ready, req_start.elapsed())
                }
                Err(e) => (Err(e), ready, req_start.elapsed()),
            }
        });
    }

    let mut success_count = 0;

    while let Some(task) = tasks.join_next().await {
        let (res, ready, elapsed) = task.expect("Task panicked");
        match res {
            Ok(_) => {
                success_count += 1;
                hist_ready.saturating_record(ready.as_micros() as u64);
                hist_elapsed.saturating_record(elapsed.as_micros() as u64);
            }
            Err(e) => match WindowError::from_boxed(e) {
                WindowError::Timeout(_) => rejections.timeouts += 1,
                WindowError::Cancelled => rejections.cancelled += 1,
                WindowError::Inner(_) => rejections.inner += 1,
            },
        }
    }

    let total_duration = start.elapsed();
    let goodput = success_count as f64 / total_duration.as_secs_f64();

    println!("--- {} ---", name);
    println!("Total Duration:  {:.2?}", total_duration);
    println!("Success/Total:   {}/{}", success_count, total_reqs);
    println!("Success Rate:    {:.2} req/sec (Goodput)", goodput);

    if success_count > 0 {
        println!("P50 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", hist_elapsed.value_at_quantile(0.99));
        println!("P50 (Ready):     {}µs", hist_ready.value_at_quantile(0.5));
        println!("P99 (Ready):     {}µs", hist_ready.value_at_quantile(0.99));
    }

    let total_errors = rejections.timeouts + rejections.cancelled + rejections.inner;
    println!("Errors:          {}", total_errors);
    if total_errors > 0 {
        println!("  └─ Timeouts:   {}", rejections.timeouts);
        if rejections.cancelled > 0 {
            println!("  └─ Cancelled:  {}", rejections.cancelled);
        }
        if rejections.inner > 0 {
            println!("  └─ Inner:      {}", rejections.inner);
        }
    }
    println!();
}

fn print_metrics(host: &str, metrics: &MetricsSnapshot) {
    println!(
        "{host}: {}/{} admitted, {} timeouts, avg wait {:.2?}, {} window resets",
        metrics.successful_requests,
        metrics.total_requests,
        metrics.timeouts,
        metrics.avg_wait_time,
        metrics.windows_reset,
    );
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);
    let latency = Duration::from_millis(args.latency_ms);

    let config = match &args.config {
        Some(path) => RegistryConfig::from_file(path)?,
        None => {
            let mut config = RegistryConfig::default();
            for (host, kind) in [
                ("rolling.local", LimiterKind::Rolling),
                ("fixed.local", LimiterKind::Fixed),
            ] {
                config.hosts.insert(
                    host.to_string(),
                    LimiterSettings {
                        kind,
                        limit: args.limit,
                        window_secs: args.window_secs,
                        ..LimiterSettings::default()
                    },
                );
            }
            config
        }
    };
    let registry = LimiterRegistry::new(config)?;

    let mut hosts: Vec<String> = registry.config().hosts.keys().cloned().collect();
    hosts.sort();
    for host in &hosts {
        let limiter = registry.get_or_create(host)?;
        let backend = service_fn(move |_req: ()| async move {
            // Simulate real-world work
            sleep(latency).await;
            Ok::<&'static str, BoxError>("success")
        });
        let svc = WindowLimitLayer::new(Arc::clone(&limiter))
            .with_timeout(timeout)
            .layer(backend);

        let name = format!("{host} ({})", limiter.kind().as_str());
        run_load_test(&name, svc, args.requests).await;
    }

    for (host, metrics) in registry.metrics() {
        print_metrics(&host, &metrics);
    }

    registry.shutdown_all(Duration::from_secs(5)).await?;
    Ok(())
}
