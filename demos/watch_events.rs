use std::env;
use std::error::Error;

use i4ops_stream::stream::proto::SecurityEvent;
use i4ops_stream::{
    ConnectionState, Severity, StreamClient, StreamEvent, StreamListener, StreamOptions,
    SubscriptionFilters,
};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

/// Prints a desktop-style notification line for events at or above `threshold`.
struct Notifier {
    threshold: Severity,
}

impl StreamListener for Notifier {
    fn on_connected(&self) {
        println!("live: subscribed to security events");
    }

    fn on_event(&self, event: &StreamEvent) {
        if !event
            .severity()
            .is_some_and(|severity| severity.meets(self.threshold))
        {
            return;
        }
        match event.decode::<SecurityEvent>() {
            Ok(security) => println!(
                "[{}] vm={} rule={:?} {}",
                security.severity, security.vm_id, security.rule, security.message
            ),
            Err(_) => println!("event {}", event.payload),
        }
    }

    fn on_error(&self, message: &str) {
        eprintln!("stream error: {message}");
    }

    fn on_disconnected(&self) {
        println!("offline");
    }

    fn on_state_changed(&self, state: ConnectionState) {
        tracing::debug!(event = "demo_state_changed", state = %state);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let threshold = env::var("I4OPS_SEVERITY")
        .ok()
        .and_then(|value| Severity::parse(&value))
        .unwrap_or(Severity::High);

    let mut client = match env::var("I4OPS_STREAM_URL") {
        Ok(url) => StreamClient::new(&url)?,
        Err(_) => StreamClient::local()?,
    };
    if let Ok(token) = env::var("I4OPS_TOKEN") {
        client = client.with_token(SecretString::new(token));
    }
    let levels = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ]
    .into_iter()
    .filter(|level| level.meets(threshold));
    let client = client.with_options(
        StreamOptions::default().with_filters(SubscriptionFilters::all().with_severity(levels)),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = client.connect(Notifier { threshold })?;
        tokio::signal::ctrl_c().await?;
        connection.disconnect()?;
        connection
            .wait_for(|snapshot| snapshot.state == ConnectionState::Disconnected)
            .await?;
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
