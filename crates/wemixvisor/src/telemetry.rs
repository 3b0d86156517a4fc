//! Installs the global tracing subscriber for the supervisor.

use eyre::WrapErr as _;
use tracing_subscriber::{
    layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
    EnvFilter,
    Layer as _,
    Registry,
};

#[must_use = "telemetry must be configured and initialized to be useful"]
pub fn configure() -> Telemetry {
    Telemetry {
        filter_directives: String::new(),
        force_stdout: false,
        pretty_print: false,
    }
}

/// Keep alive for as long as logs should be emitted.
pub struct Guard {
    _private: (),
}

pub struct Telemetry {
    filter_directives: String,
    force_stdout: bool,
    pretty_print: bool,
}

impl Telemetry {
    #[must_use]
    pub fn set_filter_directives(mut self, filter_directives: &str) -> Self {
        self.filter_directives = filter_directives.to_string();
        self
    }

    /// Logs are written to stderr unless forced to stdout.
    #[must_use]
    pub fn set_force_stdout(mut self, force_stdout: bool) -> Self {
        self.force_stdout = force_stdout;
        self
    }

    /// Logs are JSON-formatted unless pretty printing is requested.
    #[must_use]
    pub fn set_pretty_print(mut self, pretty_print: bool) -> Self {
        self.pretty_print = pretty_print;
        self
    }

    /// Installs the subscriber globally.
    ///
    /// # Errors
    /// Returns an error if the filter directives do not parse or another
    /// subscriber was installed before.
    pub fn try_init(self) -> eyre::Result<Guard> {
        let directives = if self.filter_directives.is_empty() {
            "info"
        } else {
            &self.filter_directives
        };
        let filter = EnvFilter::try_new(directives)
            .wrap_err_with(|| format!("failed parsing filter directives `{directives}`"))?;

        let fmt_layer: Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync> =
            match (self.pretty_print, self.force_stdout) {
                (true, true) => tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stdout)
                    .boxed(),
                (true, false) => tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .boxed(),
                (false, true) => tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stdout)
                    .boxed(),
                (false, false) => tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr)
                    .boxed(),
            };

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(filter)
            .try_init()
            .wrap_err("failed installing global tracing subscriber")?;
        Ok(Guard {
            _private: (),
        })
    }
}
