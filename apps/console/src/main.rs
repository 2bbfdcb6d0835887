use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{
    CacheState, ChannelOptions, ConnectionState, EventChannelClient, HttpStoreBackend, ListView,
    ListViewOptions, QueryController, WebSocketTransport,
};
use serde_json::Value;
use shared::domain::Record;

/// Watches the record list on a running server and reprints the visible page
/// whenever the read model changes.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8090")]
    server_url: String,
    #[arg(long, default_value_t = 20)]
    page_size: u32,
    #[arg(long, default_value_t = 0)]
    page: u32,
    #[arg(long)]
    search: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let cli = Cli::parse();
    let ws_url = format!("{}/ws", cli.server_url.replacen("http", "ws", 1));

    let controller = Arc::new(QueryController::new(Arc::new(HttpStoreBackend::new(
        cli.server_url.clone(),
    ))));
    let channel_client = EventChannelClient::new(
        Arc::new(WebSocketTransport),
        ChannelOptions {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            ..ChannelOptions::default()
        },
    );

    let view = ListView::open(
        controller,
        channel_client.connect(&ws_url),
        ListViewOptions {
            page_size: cli.page_size,
            filter: cli.search.clone(),
            ..ListViewOptions::default()
        },
    );
    if cli.page > 0 {
        view.set_page(cli.page);
    }

    let mut cache = view.read_model();
    let mut connection = view.connection_state();
    let mut errors = view.last_query_error();

    println!("watching {} (ctrl-c to quit)", cli.server_url);
    loop {
        tokio::select! {
            changed = cache.changed() => {
                if changed.is_err() {
                    break;
                }
                print_page(&cache.borrow_and_update());
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                match state {
                    ConnectionState::Connected => println!("-- event channel connected"),
                    ConnectionState::Reconnecting => println!("-- event channel lost, reconnecting"),
                    ConnectionState::Connecting | ConnectionState::Disconnected => {}
                }
            }
            changed = errors.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(message) = errors.borrow_and_update().as_deref() {
                    println!("-- fetch failed: {message}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    view.close();
    Ok(())
}

fn print_page(state: &CacheState) {
    let snapshot = &state.snapshot;
    let stale = if state.pending_stale { " (refreshing)" } else { "" };
    println!(
        "page {} | showing {} of {} record(s){}{stale}",
        snapshot.page_index,
        snapshot.items.len(),
        snapshot.total_count,
        snapshot
            .filter
            .as_deref()
            .map(|f| format!(" matching '{f}'"))
            .unwrap_or_default(),
    );
    for record in &snapshot.items {
        println!(
            "  #{:<6} {}  {}",
            record.id.0,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            summarize_fields(record),
        );
    }
}

/// First few scalar fields, enough to recognize the record at a glance.
fn summarize_fields(record: &Record) -> String {
    let mut parts: Vec<String> = record
        .fields
        .iter()
        .filter_map(|(key, value)| match value {
            Value::String(text) => Some(format!("{key}={text}")),
            Value::Number(number) => Some(format!("{key}={number}")),
            Value::Bool(flag) => Some(format!("{key}={flag}")),
            _ => None,
        })
        .take(4)
        .collect();
    if parts.is_empty() {
        parts.push("(no scalar fields)".to_string());
    }
    parts.join("  ")
}
