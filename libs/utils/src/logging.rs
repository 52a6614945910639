use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
    Test,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use LogFormat::*;
        match s {
            "plain" => Ok(Plain),
            "json" => Ok(Json),
            "test" => Ok(Test),
            _ => anyhow::bail!("Unknown log format: '{s}', expected one of 'plain', 'json', 'test'"),
        }
    }
}

pub enum Output {
    Stdout,
    Stderr,
}

/// Receives every formatted log line: `(level, message)`.
pub type LogForward = Box<dyn Fn(&str, &str) + Send + Sync>;

struct ForwardLayer(LogForward);

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ForwardLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        struct MessageVisitor<'a>(&'a mut String);
        impl tracing::field::Visit for MessageVisitor<'_> {
            fn record_debug(
                &mut self,
                field: &tracing::field::Field,
                value: &dyn std::fmt::Debug,
            ) {
                if field.name() == "message" {
                    use std::fmt::Write;
                    let _ = write!(self.0, "{value:?}");
                }
            }
        }

        let mut text = String::new();
        event.record(&mut MessageVisitor(&mut text));
        if !text.is_empty() {
            (self.0)(event.metadata().level().as_str(), &text);
        }
    }
}

/// Initialize the process-wide tracing subscriber.
///
/// Filtering defaults to `info` and is overridable through `RUST_LOG`.
pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    init_with_forward(log_format, output, None)
}

/// Like [`init`], with an extra sink that receives each log line; the
/// daemon uses it to forward output to attached clients.
pub fn init_with_forward(
    log_format: LogFormat,
    output: Output,
    forward: Option<LogForward>,
) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer as _;

    let default_filter_str = "info";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(move || -> Box<dyn std::io::Write> {
            match output {
                Output::Stdout => Box::new(std::io::stdout()),
                Output::Stderr => Box::new(std::io::stderr()),
            }
        });
    let fmt_layer = match log_format {
        LogFormat::Json => fmt_layer.json().boxed(),
        LogFormat::Plain => fmt_layer.boxed(),
        LogFormat::Test => fmt_layer.with_test_writer().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(forward.map(ForwardLayer))
        .init();

    Ok(())
}

/// Replace the default panic hook with one that routes the panic message
/// through tracing before aborting, so that crashes show up in the same
/// stream as regular logs.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".to_string());
        tracing::error!(%location, "panic: {info}");
        default_hook(info);
    }));
}

/// Parse a format string from config/CLI, with context in the error.
pub fn parse_format_arg(arg: &str) -> anyhow::Result<LogFormat> {
    LogFormat::from_config(arg).context("parsing log format")
}
