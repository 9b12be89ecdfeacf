use std::env;

use tracing::{dispatcher, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, Layer, Registry,
};

const KEY: &str = "RUST_LOG";

fn init_layer_env_filter<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    ::tracing_subscriber::EnvFilter::from_default_env()
}

fn init_layer_stdfmt<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    ::tracing_subscriber::fmt::layer()
}

pub fn init_once() {
    // Skip init if has been set
    if dispatcher::has_been_set() {
        return;
    }

    // set default tracing level
    if env::var_os(KEY).is_none() {
        env::set_var(KEY, "INFO");
    }

    Registry::default()
        .with(init_layer_env_filter())
        .with(init_layer_stdfmt())
        .init()
}
