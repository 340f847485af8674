use anyhow::Context;
use bytes::Bytes;
use multifetch::{MultiplexConfig, TransferError};

const DEFAULT_URLS: &[&str] = &[
    "https://curl.se/libcurl/c/multi-uv.html",
    "https://curl.se/libcurl/c/multi-event.html",
    "https://en.cppreference.com/w/cpp/container/vector",
    "https://www.boost.org/",
    "https://www.qq.com/",
    "https://www.baidu.com/",
];

fn usage() -> &'static str {
    "Usage: multifetch [--config <path/to/multifetch.toml>] [URL...]"
}

struct Args {
    config: Option<String>,
    urls: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    let mut urls = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| anyhow::anyhow!(usage()))?;
                config = Some(path);
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => anyhow::bail!("unknown option {flag}\n{}", usage()),
            _ => urls.push(arg),
        }
    }

    if urls.is_empty() {
        urls = DEFAULT_URLS.iter().map(|u| u.to_string()).collect();
    }
    Ok(Args { config, urls })
}

fn report(url: &str, body: Bytes, error: Option<TransferError>) {
    match error {
        None => tracing::info!(url, bytes = body.len(), "finished"),
        Some(e) => tracing::warn!(url, kind = %e.kind, "failed: {}", e.message),
    }
}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    use multifetch::{Coordinator, CurlEngine, TokioReactor};

    multifetch::logging::init_tracing();
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => MultiplexConfig::load(path)
            .with_context(|| format!("failed to load config {path}"))?,
        None => MultiplexConfig::default(),
    };

    let engine = CurlEngine::new(config.transfer.clone()).context("failed to create curl engine")?;
    let reactor = TokioReactor::new().context("failed to create reactor")?;
    let mut coordinator = Coordinator::with_config(engine, reactor, report, &config);

    for url in &args.urls {
        if let Err(e) = coordinator.register(url.as_str()) {
            tracing::warn!(%url, "skipping: {}", e);
        }
    }

    let stats = coordinator.run().context("multiplex loop failed")?;
    println!(
        "{} succeeded, {} failed, {} bytes",
        stats.succeeded, stats.failed, stats.bytes_received
    );
    Ok(())
}

#[cfg(not(unix))]
fn main() -> anyhow::Result<()> {
    let _ = (parse_args, report, MultiplexConfig::default);
    anyhow::bail!("multifetch needs a unix readiness reactor")
}
